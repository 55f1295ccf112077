//! The sqlite `.index` file kept next to each segment.

use super::sidecar;
use super::Summary;
use crate::dir::with_suffix;
use crate::error::{CoreError, CoreResult};
use crate::record::{Record, Source, UniqueKey};
use crate::types::{format_time, parse_time, TimeSpan};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS md (
    id INTEGER PRIMARY KEY,
    offset INTEGER NOT NULL,
    size INTEGER NOT NULL,
    reftime TEXT NOT NULL,
    uniq BLOB UNIQUE,
    attrs BLOB NOT NULL);
CREATE INDEX IF NOT EXISTS md_reftime ON md (reftime, offset);
";

/// Path of the index of the segment at `abspath`.
pub(crate) fn index_path(abspath: &Path) -> PathBuf {
    with_suffix(abspath, ".index")
}

/// An open per-segment index.
#[derive(Debug)]
pub(crate) struct SegmentDb {
    conn: Connection,
    relpath: String,
}

type Row = (i64, i64, String, Vec<u8>);

impl SegmentDb {
    /// Opens the index, or returns `None` if it does not exist.
    pub(crate) fn open_existing(abspath: &Path, relpath: &str) -> CoreResult<Option<Self>> {
        let path = index_path(abspath);
        if !path.is_file() {
            return Ok(None);
        }
        Self::open(&path, relpath).map(Some)
    }

    /// Opens the index, creating it if needed.
    pub(crate) fn create(abspath: &Path, relpath: &str) -> CoreResult<Self> {
        let path = index_path(abspath);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(&path, relpath)
    }

    fn open(path: &Path, relpath: &str) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            relpath: relpath.to_string(),
        })
    }

    pub(crate) fn begin(&self) -> CoreResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub(crate) fn commit(&self) -> CoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub(crate) fn rollback(&self) -> CoreResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn decode(&self, row: Row, root: &Path, format: &str) -> CoreResult<Record> {
        let (offset, size, reftime, attrs) = row;
        let attrs: BTreeMap<String, String> = sidecar::decode(&attrs)?;
        let to_u64 = |v: i64| {
            u64::try_from(v).map_err(|_| CoreError::corrupted(format!("negative offset or size {v}")))
        };
        Ok(Record {
            format: format.to_string(),
            reftime: Some(parse_time(&reftime)?),
            attrs,
            source: Some(Source::new(
                format,
                root,
                self.relpath.clone(),
                to_u64(offset)?,
                to_u64(size)?,
            )),
            data: None,
        })
    }

    /// Records in the segment, by reference time then offset.
    pub(crate) fn records(
        &self,
        root: &Path,
        format: &str,
        span: Option<&TimeSpan>,
    ) -> CoreResult<Vec<Record>> {
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Row> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        };
        let rows: Vec<Row> = match span {
            Some(span) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT offset, size, reftime, attrs FROM md
                     WHERE reftime >= ?1 AND reftime <= ?2 ORDER BY reftime, offset",
                )?;
                let rows = stmt.query_map(
                    params![format_time(&span.begin), format_time(&span.end)],
                    map,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT offset, size, reftime, attrs FROM md ORDER BY reftime, offset",
                )?;
                let rows = stmt.query_map([], map)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };
        rows.into_iter()
            .map(|row| self.decode(row, root, format))
            .collect()
    }

    /// Source of the record with `key`, if any.
    pub(crate) fn find(&self, key: &UniqueKey, root: &Path, format: &str) -> CoreResult<Option<Source>> {
        let found: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT offset, size FROM md WHERE uniq = ?1",
                params![key.as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(found.map(|(offset, size)| {
            Source::new(
                format,
                root,
                self.relpath.clone(),
                offset.unsigned_abs(),
                size.unsigned_abs(),
            )
        }))
    }

    pub(crate) fn delete(&self, key: &UniqueKey) -> CoreResult<()> {
        self.conn
            .execute("DELETE FROM md WHERE uniq = ?1", params![key.as_slice()])?;
        Ok(())
    }

    pub(crate) fn clear(&self) -> CoreResult<()> {
        self.conn.execute("DELETE FROM md", [])?;
        Ok(())
    }

    pub(crate) fn insert(&self, record: &Record, key: &UniqueKey) -> CoreResult<()> {
        let source = record.stored_source()?;
        let reftime = record
            .reftime
            .as_ref()
            .ok_or_else(|| CoreError::corrupted("cannot index a record without reference time"))?;
        let to_i64 = |v: u64| {
            i64::try_from(v).map_err(|_| CoreError::invalid_operation(format!("offset {v} too large")))
        };
        let result = self.conn.execute(
            "INSERT INTO md (offset, size, reftime, uniq, attrs) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                to_i64(source.offset)?,
                to_i64(source.size)?,
                format_time(reftime),
                key.as_slice(),
                sidecar::encode(&record.attrs)?
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(CoreError::DuplicateKey {
                    relpath: self.relpath.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn summary(&self) -> CoreResult<Summary> {
        let (count, size, begin, end): (i64, Option<i64>, Option<String>, Option<String>) =
            self.conn.query_row(
                "SELECT COUNT(*), SUM(size), MIN(reftime), MAX(reftime) FROM md",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let span = match (begin, end) {
            (Some(begin), Some(end)) => Some(TimeSpan::new(parse_time(&begin)?, parse_time(&end)?)),
            _ => None,
        };
        Ok(Summary {
            count: count.unsigned_abs(),
            size: size.unwrap_or(0).unsigned_abs(),
            span,
        })
    }

    pub(crate) fn vacuum(&self) -> CoreResult<()> {
        self.conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }
}
