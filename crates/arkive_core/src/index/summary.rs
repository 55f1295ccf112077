//! Aggregate statistics over records.

use crate::dir::{self, remove_if_exists};
use crate::error::CoreResult;
use crate::index::sidecar;
use crate::record::Record;
use crate::types::{merge_spans, TimeSpan};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Count, total size and time coverage of a set of records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of records.
    pub count: u64,
    /// Total record size in bytes.
    pub size: u64,
    /// Reference times covered.
    pub span: Option<TimeSpan>,
}

impl Summary {
    /// Summarizes `records`.
    #[must_use]
    pub fn of<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.add(record);
        }
        summary
    }

    /// Adds one record.
    pub fn add(&mut self, record: &Record) {
        self.count += 1;
        self.size += record.source.as_ref().map_or(0, |s| s.size);
        if let Some(reftime) = record.reftime {
            self.span = merge_spans(self.span, TimeSpan::instant(reftime));
        }
    }

    /// Adds everything in `other`.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.size += other.size;
        if let Some(span) = other.span {
            self.span = merge_spans(self.span, span);
        }
    }

    /// Returns true if no records were added.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// The dataset-wide summary cached at `<root>/summary`.
#[derive(Debug, Clone)]
pub struct SummaryCache {
    path: PathBuf,
}

impl SummaryCache {
    /// Creates a handle for the cache of the dataset at `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("summary"),
        }
    }

    /// Returns the cached summary, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache exists but cannot be decoded.
    pub fn read(&self) -> CoreResult<Option<Summary>> {
        sidecar::read_cbor(&self.path)
    }

    /// Stores `summary` in the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be written.
    pub fn write(&self, summary: &Summary) -> CoreResult<()> {
        dir::write_atomically(&self.path, &sidecar::encode(summary)?)?;
        debug!(path = %self.path.display(), count = summary.count, "summary cache written");
        Ok(())
    }

    /// Drops the cache.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be removed.
    pub fn invalidate(&self) -> CoreResult<()> {
        if remove_if_exists(&self.path)? {
            debug!(path = %self.path.display(), "summary cache invalidated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Vm2Format;
    use crate::record::Source;
    use crate::types::parse_time;
    use tempfile::tempdir;

    fn rec(time: &str, size: u64) -> Record {
        let mut r = Vm2Format::record(parse_time(time).unwrap(), "1", "227", "1");
        r.source = Some(Source::new("vm2", "/ds", "a.vm2", 0, size));
        r
    }

    #[test]
    fn summary_counts_and_spans() {
        let a = rec("2007-07-08 13:00:00", 10);
        let b = rec("2007-07-07 00:00:00", 5);
        let s = Summary::of([&a, &b]);
        assert_eq!(s.count, 2);
        assert_eq!(s.size, 15);
        assert_eq!(
            s.span,
            Some(TimeSpan::new(b.reftime.unwrap(), a.reftime.unwrap()))
        );

        let mut total = Summary::default();
        assert!(total.is_empty());
        total.merge(&s);
        total.merge(&s);
        assert_eq!(total.count, 4);
        assert_eq!(total.span, s.span);
    }

    #[test]
    fn cache_roundtrip_and_invalidate() {
        let dir = tempdir().unwrap();
        let cache = SummaryCache::new(dir.path());
        assert_eq!(cache.read().unwrap(), None);
        let s = Summary::of([&rec("2007-07-08 13:00:00", 10)]);
        cache.write(&s).unwrap();
        assert_eq!(cache.read().unwrap(), Some(s));
        cache.invalidate().unwrap();
        assert_eq!(cache.read().unwrap(), None);
    }
}
