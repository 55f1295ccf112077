//! Dataset-wide list of segments with their modification times and spans.
//!
//! Two interchangeable backends:
//!
//! - [`PlainManifest`]: a `MANIFEST` text file, one `relpath;mtime;start;end`
//!   line per segment, re-read whenever the file changes on disk
//! - [`SqliteManifest`]: an `index.sqlite` database with indexed range
//!   queries
//!
//! Both return the same segments for the same range.

use crate::config::IndexKind;
use crate::dir::write_atomically;
use crate::error::{CoreError, CoreResult};
use crate::types::{format_time, parse_time, TimeSpan};
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// File name of the plain manifest.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// File name of the sqlite manifest.
pub const SQLITE_FILE: &str = "index.sqlite";

/// One indexed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Segment path relative to the dataset root.
    pub relpath: String,
    /// Segment modification time when it was indexed.
    pub mtime: i64,
    /// Reference times covered by the segment.
    pub span: TimeSpan,
}

/// Storage of manifest entries.
pub trait Manifest: Send + Debug {
    /// Returns all entries, sorted by relpath.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read.
    fn entries(&mut self) -> CoreResult<Vec<ManifestEntry>>;

    /// Returns the entry for one segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read.
    fn get(&mut self, relpath: &str) -> CoreResult<Option<ManifestEntry>>;

    /// Returns the relpaths of segments intersecting `span`, sorted. `None`
    /// selects everything.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read.
    fn segments_in_range(&mut self, span: Option<&TimeSpan>) -> CoreResult<Vec<String>>;

    /// Inserts or replaces the entry for `entry.relpath`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated.
    fn acquire(&mut self, entry: ManifestEntry) -> CoreResult<()>;

    /// Deletes the entry for `relpath`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be updated.
    fn remove(&mut self, relpath: &str) -> CoreResult<()>;

    /// Persists pending changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    fn flush(&mut self) -> CoreResult<()>;

    /// Compacts the storage.
    ///
    /// # Errors
    ///
    /// Returns an error if compaction fails.
    fn vacuum(&mut self) -> CoreResult<()>;
}

/// Returns true if a manifest of `kind` exists under `root`.
#[must_use]
pub fn exists(root: &Path, kind: IndexKind) -> bool {
    match kind {
        IndexKind::Plain => root.join(MANIFEST_FILE).is_file(),
        IndexKind::Sqlite => root.join(SQLITE_FILE).is_file(),
        IndexKind::PerSegment => false,
    }
}

/// Opens the manifest backend for `kind`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidConfig`] for the per-segment kind, which has
/// no manifest, or an error opening the backend.
pub fn open_manifest(root: &Path, kind: IndexKind) -> CoreResult<Box<dyn Manifest>> {
    match kind {
        IndexKind::Plain => Ok(Box::new(PlainManifest::open(root)?)),
        IndexKind::Sqlite => Ok(Box::new(SqliteManifest::open(root, true)?)),
        IndexKind::PerSegment => Err(CoreError::invalid_config(
            "per-segment indexes have no manifest",
        )),
    }
}

/// What identifies one version of the `MANIFEST` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    modified: SystemTime,
    len: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    fn of(path: &Path) -> CoreResult<Option<Self>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Self {
            modified: meta.modified()?,
            len: meta.len(),
            #[cfg(unix)]
            ino: std::os::unix::fs::MetadataExt::ino(&meta),
        }))
    }
}

/// Manifest kept as a text file.
#[derive(Debug)]
pub struct PlainManifest {
    path: PathBuf,
    entries: Vec<ManifestEntry>,
    identity: Option<FileIdentity>,
    dirty: bool,
}

impl PlainManifest {
    /// Opens the manifest of the dataset at `root`; a missing file is an
    /// empty manifest.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ManifestParse`] if the file is malformed.
    pub fn open(root: &Path) -> CoreResult<Self> {
        let mut manifest = Self {
            path: root.join(MANIFEST_FILE),
            entries: Vec::new(),
            identity: None,
            dirty: false,
        };
        manifest.reread()?;
        Ok(manifest)
    }

    /// Reloads the file if it changed since it was last read. Unflushed
    /// changes are kept.
    fn reread(&mut self) -> CoreResult<()> {
        if self.dirty {
            return Ok(());
        }
        let identity = FileIdentity::of(&self.path)?;
        if identity == self.identity {
            return Ok(());
        }
        self.entries = match identity {
            Some(_) => parse_manifest(&self.path, &fs::read_to_string(&self.path)?)?,
            None => Vec::new(),
        };
        self.identity = identity;
        debug!(path = %self.path.display(), entries = self.entries.len(), "manifest loaded");
        Ok(())
    }

    fn position(&self, relpath: &str) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| e.relpath.as_str().cmp(relpath))
    }
}

fn parse_manifest(path: &Path, text: &str) -> CoreResult<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let error = |message: String| CoreError::ManifestParse {
            path: path.to_path_buf(),
            line: lineno + 1,
            message,
        };
        let fields: Vec<&str> = line.splitn(4, ';').collect();
        if fields.len() < 4 {
            let n = fields.len();
            return Err(error(format!(
                "line has only {n} field{}",
                if n == 1 { "" } else { "s" }
            )));
        }
        let mtime = fields[1]
            .parse::<i64>()
            .map_err(|e| error(format!("invalid mtime {:?}: {e}", fields[1])))?;
        let begin = parse_time(fields[2]).map_err(|e| error(e.to_string()))?;
        let end = parse_time(fields[3]).map_err(|e| error(e.to_string()))?;
        entries.push(ManifestEntry {
            relpath: fields[0].to_string(),
            mtime,
            span: TimeSpan::new(begin, end),
        });
    }
    entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
    Ok(entries)
}

impl Manifest for PlainManifest {
    fn entries(&mut self) -> CoreResult<Vec<ManifestEntry>> {
        self.reread()?;
        Ok(self.entries.clone())
    }

    fn get(&mut self, relpath: &str) -> CoreResult<Option<ManifestEntry>> {
        self.reread()?;
        Ok(self.position(relpath).ok().map(|i| self.entries[i].clone()))
    }

    fn segments_in_range(&mut self, span: Option<&TimeSpan>) -> CoreResult<Vec<String>> {
        self.reread()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| span.map_or(true, |s| s.intersects(&e.span)))
            .map(|e| e.relpath.clone())
            .collect())
    }

    fn acquire(&mut self, entry: ManifestEntry) -> CoreResult<()> {
        self.reread()?;
        match self.position(&entry.relpath) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
        self.dirty = true;
        Ok(())
    }

    fn remove(&mut self, relpath: &str) -> CoreResult<()> {
        self.reread()?;
        if let Ok(i) = self.position(relpath) {
            self.entries.remove(i);
            self.dirty = true;
        }
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!(
                "{};{};{};{}\n",
                e.relpath,
                e.mtime,
                format_time(&e.span.begin),
                format_time(&e.span.end)
            ));
        }
        write_atomically(&self.path, out.as_bytes())?;
        self.identity = FileIdentity::of(&self.path)?;
        self.dirty = false;
        Ok(())
    }

    fn vacuum(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

/// Manifest kept in an sqlite database.
#[derive(Debug)]
pub struct SqliteManifest {
    conn: Connection,
}

impl SqliteManifest {
    /// Opens `index.sqlite` under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the database is missing and
    /// `create` is false, or an sqlite error.
    pub fn open(root: &Path, create: bool) -> CoreResult<Self> {
        let path = root.join(SQLITE_FILE);
        if !create && !path.exists() {
            return Err(CoreError::not_found(format!("index {}", path.display())));
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 id INTEGER PRIMARY KEY,
                 file TEXT NOT NULL,
                 mtime INTEGER NOT NULL,
                 start_time TEXT NOT NULL,
                 end_time TEXT NOT NULL,
                 UNIQUE(file));
             CREATE INDEX IF NOT EXISTS idx_files_start ON files (start_time);
             CREATE INDEX IF NOT EXISTS idx_files_end ON files (end_time);",
        )?;
        Ok(Self { conn })
    }

    fn entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn decode(raw: (String, i64, String, String)) -> CoreResult<ManifestEntry> {
        let (relpath, mtime, begin, end) = raw;
        Ok(ManifestEntry {
            relpath,
            mtime,
            span: TimeSpan::new(parse_time(&begin)?, parse_time(&end)?),
        })
    }
}

impl Manifest for SqliteManifest {
    fn entries(&mut self) -> CoreResult<Vec<ManifestEntry>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT file, mtime, start_time, end_time FROM files ORDER BY file")?;
        let rows = stmt.query_map([], Self::entry)?;
        rows.map(|row| Self::decode(row?)).collect()
    }

    fn get(&mut self, relpath: &str) -> CoreResult<Option<ManifestEntry>> {
        let raw = self
            .conn
            .query_row(
                "SELECT file, mtime, start_time, end_time FROM files WHERE file = ?1",
                params![relpath],
                Self::entry,
            )
            .optional()?;
        raw.map(Self::decode).transpose()
    }

    fn segments_in_range(&mut self, span: Option<&TimeSpan>) -> CoreResult<Vec<String>> {
        let mut files = Vec::new();
        match span {
            Some(span) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT file FROM files WHERE end_time >= ?1 AND start_time <= ?2 ORDER BY file",
                )?;
                let rows = stmt.query_map(
                    params![format_time(&span.begin), format_time(&span.end)],
                    |row| row.get::<_, String>(0),
                )?;
                for row in rows {
                    files.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare_cached("SELECT file FROM files ORDER BY file")?;
                for row in stmt.query_map([], |row| row.get::<_, String>(0))? {
                    files.push(row?);
                }
            }
        }
        Ok(files)
    }

    fn acquire(&mut self, entry: ManifestEntry) -> CoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO files (file, mtime, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.relpath,
                entry.mtime,
                format_time(&entry.span.begin),
                format_time(&entry.span.end)
            ],
        )?;
        Ok(())
    }

    fn remove(&mut self, relpath: &str) -> CoreResult<()> {
        self.conn
            .execute("DELETE FROM files WHERE file = ?1", params![relpath])?;
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn vacuum(&mut self) -> CoreResult<()> {
        self.conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(relpath: &str, begin: &str, end: &str) -> ManifestEntry {
        ManifestEntry {
            relpath: relpath.into(),
            mtime: 1_000,
            span: TimeSpan::new(parse_time(begin).unwrap(), parse_time(end).unwrap()),
        }
    }

    fn fill(manifest: &mut dyn Manifest) {
        manifest
            .acquire(entry("2007/07-08.vm2", "2007-07-08 00:00:00", "2007-07-08 23:59:59"))
            .unwrap();
        manifest
            .acquire(entry("2007/07-07.vm2", "2007-07-07 00:00:00", "2007-07-07 23:59:59"))
            .unwrap();
        manifest
            .acquire(entry("2007/10-09.vm2", "2007-10-09 00:00:00", "2007-10-09 23:59:59"))
            .unwrap();
        manifest.flush().unwrap();
    }

    fn range_queries(manifest: &mut dyn Manifest) {
        let span = TimeSpan::new(
            parse_time("2007-07-08 12:00:00").unwrap(),
            parse_time("2007-10-01 00:00:00").unwrap(),
        );
        assert_eq!(manifest.segments_in_range(Some(&span)).unwrap(), vec!["2007/07-08.vm2"]);
        assert_eq!(
            manifest.segments_in_range(None).unwrap(),
            vec!["2007/07-07.vm2", "2007/07-08.vm2", "2007/10-09.vm2"]
        );
        let edge = TimeSpan::instant(parse_time("2007-07-07 23:59:59").unwrap());
        assert_eq!(manifest.segments_in_range(Some(&edge)).unwrap(), vec!["2007/07-07.vm2"]);
    }

    #[test]
    fn plain_manifest_writes_sorted_lines() {
        let dir = tempdir().unwrap();
        let mut manifest = PlainManifest::open(dir.path()).unwrap();
        fill(&mut manifest);
        range_queries(&mut manifest);

        let text = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        let first = text.lines().next().unwrap();
        assert_eq!(first, "2007/07-07.vm2;1000;2007-07-07 00:00:00;2007-07-07 23:59:59");
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn sqlite_manifest_matches_plain() {
        let dir = tempdir().unwrap();
        let mut manifest = SqliteManifest::open(dir.path(), true).unwrap();
        fill(&mut manifest);
        range_queries(&mut manifest);
        assert_eq!(
            manifest.get("2007/07-08.vm2").unwrap(),
            Some(entry("2007/07-08.vm2", "2007-07-08 00:00:00", "2007-07-08 23:59:59"))
        );
    }

    #[test]
    fn acquire_replaces_and_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut backends: Vec<Box<dyn Manifest>> = vec![
            open_manifest(dir.path(), IndexKind::Plain).unwrap(),
            open_manifest(dir.path(), IndexKind::Sqlite).unwrap(),
        ];
        for manifest in &mut backends {
            fill(manifest.as_mut());
            let mut updated = entry("2007/07-08.vm2", "2007-07-08 00:00:00", "2007-07-08 23:59:59");
            updated.mtime = 2_000;
            manifest.acquire(updated.clone()).unwrap();
            assert_eq!(manifest.get("2007/07-08.vm2").unwrap(), Some(updated));
            manifest.remove("2007/07-08.vm2").unwrap();
            manifest.remove("2007/07-08.vm2").unwrap();
            manifest.flush().unwrap();
            assert_eq!(manifest.entries().unwrap().len(), 2);
        }
    }

    #[test]
    fn plain_manifest_sees_other_writers() {
        let dir = tempdir().unwrap();
        let mut reader = PlainManifest::open(dir.path()).unwrap();
        assert!(reader.entries().unwrap().is_empty());

        let mut writer = PlainManifest::open(dir.path()).unwrap();
        fill(&mut writer);
        assert_eq!(reader.entries().unwrap().len(), 3);
    }

    #[test]
    fn corrupt_line_reports_position() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            "2007/07-07.vm2;1000;2007-07-07 00:00:00;2007-07-07 23:59:59\n2007/07-08.vm2;1000\n",
        )
        .unwrap();
        let err = PlainManifest::open(dir.path()).unwrap_err();
        match err {
            CoreError::ManifestParse { line, message, .. } => {
                assert_eq!(line, 2);
                assert_eq!(message, "line has only 2 fields");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn missing_sqlite_store_is_reported() {
        let dir = tempdir().unwrap();
        assert!(!exists(dir.path(), IndexKind::Sqlite));
        assert!(matches!(
            SqliteManifest::open(dir.path(), false),
            Err(CoreError::NotFound { .. })
        ));
    }
}
