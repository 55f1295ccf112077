//! Dataset directory layout and filesystem helpers.
//!
//! ```text
//! <root>/
//! ├── lock, lock.append, lock.check   # dataset locks
//! ├── MANIFEST | index.sqlite         # plain/sqlite index
//! ├── summary                         # cached dataset summary
//! ├── needs-check-do-not-pack         # set after a failed maintenance run
//! ├── needs-rebuild                   # set when the index cannot be trusted
//! ├── .archive/last/<relpath>         # archived segments
//! └── <relpath>                       # segments and their sidecars
//! ```

use crate::error::{CoreError, CoreResult};
use std::fs::{self, File, FileTimes};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the archive directory under the dataset root.
pub const ARCHIVE_DIR: &str = ".archive";

/// Name of the sequence file marking a directory segment.
pub const SEQUENCE_FILE: &str = ".sequence";

/// Marker files recording the dataset's maintenance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Repack must not run until a check with fix succeeds.
    DoNotPack,
    /// The index is missing or out of date and must be rebuilt.
    NeedsRebuild,
}

impl Flag {
    /// The marker file name.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::DoNotPack => "needs-check-do-not-pack",
            Self::NeedsRebuild => "needs-rebuild",
        }
    }
}

/// The root directory of a dataset.
#[derive(Debug, Clone)]
pub struct DatasetDir {
    root: PathBuf,
}

impl DatasetDir {
    /// Opens a dataset directory, creating it if requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing and `create_if_missing`
    /// is false, or if it cannot be created.
    pub fn open(root: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !root.exists() {
            if create_if_missing {
                fs::create_dir_all(root)?;
            } else {
                return Err(CoreError::not_found(format!(
                    "dataset directory {}",
                    root.display()
                )));
            }
        } else if !root.is_dir() {
            return Err(CoreError::invalid_config(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the dataset root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the absolute path of a segment.
    #[must_use]
    pub fn abspath(&self, relpath: &str) -> PathBuf {
        self.root.join(relpath)
    }

    /// Returns the root of the archive that maintenance moves segments to.
    #[must_use]
    pub fn archive_root(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR).join("last")
    }

    /// Returns where a segment goes when archived.
    #[must_use]
    pub fn archive_path(&self, relpath: &str) -> PathBuf {
        self.archive_root().join(relpath)
    }

    /// Returns true if the flag file exists.
    #[must_use]
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.root.join(flag.file_name()).exists()
    }

    /// Creates the flag file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created.
    pub fn set_flag(&self, flag: Flag) -> CoreResult<()> {
        let path = self.root.join(flag.file_name());
        if !path.exists() {
            File::create(&path)?.sync_all()?;
            sync_directory(&self.root)?;
        }
        Ok(())
    }

    /// Removes the flag file if present.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file exists and cannot be removed.
    pub fn clear_flag(&self, flag: Flag) -> CoreResult<()> {
        remove_if_exists(&self.root.join(flag.file_name()))?;
        Ok(())
    }

    /// Lists the relpaths of all segments of `format` on disk, sorted.
    ///
    /// Dot-entries (including the archive) are skipped, as are sidecars,
    /// lock files and leftovers of interrupted repacks.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be read.
    pub fn list_segments(&self, format: &str) -> CoreResult<Vec<String>> {
        let mut out = Vec::new();
        walk(&self.root, "", format, &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn walk(dir: &Path, prefix: &str, format: &str, out: &mut Vec<String>) -> CoreResult<()> {
    let data_ext = format!(".{format}");
    let compressed_ext = format!(".{format}.lz4");
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let relpath = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if name.ends_with(&data_ext) {
                if entry.path().join(SEQUENCE_FILE).exists() {
                    out.push(relpath);
                }
            } else if !name.contains('.') {
                walk(&entry.path(), &relpath, format, out)?;
            }
        } else if file_type.is_file() {
            if name.ends_with(&data_ext) {
                out.push(relpath);
            } else if let Some(stripped) = relpath.strip_suffix(".lz4") {
                if name.ends_with(&compressed_ext) {
                    out.push(stripped.to_string());
                }
            }
        }
    }
    Ok(())
}

/// Returns `path` with `suffix` appended to its file name.
#[must_use]
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Returns the modification time of `path` in seconds since the epoch.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be inspected.
pub fn mtime(path: &Path) -> CoreResult<i64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    })
}

/// Returns the modification time of `path`, or `None` if it does not exist.
///
/// # Errors
///
/// Returns an I/O error other than not-found.
pub fn mtime_if_exists(path: &Path) -> CoreResult<Option<i64>> {
    match mtime(path) {
        Ok(t) => Ok(Some(t)),
        Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Captured access and modification times of a file.
#[derive(Debug, Clone, Copy)]
pub struct SavedTimes {
    accessed: SystemTime,
    modified: SystemTime,
}

impl SavedTimes {
    /// Reads the current times of `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be inspected.
    pub fn of(path: &Path) -> CoreResult<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            accessed: meta.accessed()?,
            modified: meta.modified()?,
        })
    }

    /// Puts the saved times back on `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the times cannot be set.
    pub fn restore(&self, path: &Path) -> CoreResult<()> {
        let file = File::options().write(true).open(path)?;
        file.set_times(
            FileTimes::new()
                .set_accessed(self.accessed)
                .set_modified(self.modified),
        )?;
        Ok(())
    }
}

/// Sets the modification time of `path` to `secs` since the epoch.
///
/// # Errors
///
/// Returns an I/O error if the time cannot be set.
pub fn set_mtime(path: &Path, secs: i64) -> CoreResult<()> {
    let when = UNIX_EPOCH + std::time::Duration::from_secs(u64::try_from(secs).unwrap_or(0));
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(when).set_modified(when))?;
    Ok(())
}

/// Writes `data` to `path` through a temporary file and a rename.
///
/// # Errors
///
/// Returns an I/O error if any step fails.
pub fn write_atomically(path: &Path, data: &[u8]) -> CoreResult<()> {
    let temp = with_suffix(path, ".tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)?;
    if let Some(parent) = path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

/// Removes a file, ignoring a missing one. Returns true if it existed.
///
/// # Errors
///
/// Returns any I/O error other than not-found.
pub fn remove_if_exists(path: &Path) -> CoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Renames `from` to `to` if `from` exists. Returns true if it did.
///
/// # Errors
///
/// Returns any I/O error other than a missing source.
pub fn rename_if_exists(from: &Path, to: &Path) -> CoreResult<bool> {
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Makes directory entry changes in `dir` durable.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be synced.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Makes directory entry changes in `dir` durable.
///
/// NTFS journals metadata, so there is nothing to do here.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            DatasetDir::open(&missing, false),
            Err(CoreError::NotFound { .. })
        ));
        assert!(DatasetDir::open(&missing, true).is_ok());
        assert!(missing.is_dir());
    }

    #[test]
    fn flags_set_and_clear() {
        let dir = tempdir().unwrap();
        let ds = DatasetDir::open(dir.path(), false).unwrap();
        assert!(!ds.has_flag(Flag::DoNotPack));
        ds.set_flag(Flag::DoNotPack).unwrap();
        ds.set_flag(Flag::DoNotPack).unwrap();
        assert!(ds.has_flag(Flag::DoNotPack));
        assert!(dir.path().join("needs-check-do-not-pack").exists());
        ds.clear_flag(Flag::DoNotPack).unwrap();
        ds.clear_flag(Flag::DoNotPack).unwrap();
        assert!(!ds.has_flag(Flag::DoNotPack));
    }

    #[test]
    fn list_segments_skips_sidecars_and_archive() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("2007/07-07.vm2"));
        touch(&root.join("2007/07-07.vm2.metadata"));
        touch(&root.join("2007/07-07.vm2.summary"));
        touch(&root.join("2007/07-07.vm2.lock"));
        touch(&root.join("2007/07-07.vm2.repack"));
        touch(&root.join("2007/07-08.vm2.lz4"));
        touch(&root.join("2007/07-08.vm2.lz4.idx"));
        touch(&root.join("2007/07-09.vm2/.sequence"));
        touch(&root.join("2007/07-09.vm2/000000.vm2"));
        touch(&root.join("2007/07-10.vm2.repack/000000.vm2"));
        touch(&root.join("2007/07-10.vm2.repack/.sequence"));
        touch(&root.join("2007/07-12.vm2.repack-old/000000.vm2"));
        touch(&root.join("2007/07-11.frame"));
        touch(&root.join(".archive/last/2006/01-01.vm2"));
        touch(&root.join("MANIFEST"));

        let ds = DatasetDir::open(root, false).unwrap();
        assert_eq!(
            ds.list_segments("vm2").unwrap(),
            vec!["2007/07-07.vm2", "2007/07-08.vm2", "2007/07-09.vm2"]
        );
    }

    #[test]
    fn write_atomically_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary");
        write_atomically(&path, b"one").unwrap();
        write_atomically(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[test]
    fn saved_times_survive_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.vm2");
        fs::write(&path, b"abc").unwrap();
        set_mtime(&path, 1_000_000).unwrap();
        let saved = SavedTimes::of(&path).unwrap();

        fs::write(&path, b"abcdef").unwrap();
        saved.restore(&path).unwrap();
        assert_eq!(mtime(&path).unwrap(), 1_000_000);
    }

    #[test]
    fn mtime_if_exists_handles_missing() {
        let dir = tempdir().unwrap();
        assert_eq!(mtime_if_exists(&dir.path().join("none")).unwrap(), None);
    }
}
