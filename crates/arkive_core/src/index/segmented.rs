//! Index made of one sqlite database per segment.

use super::segment_db::{index_path, SegmentDb};
use super::{DatasetIndex, IndexUpdate, Summary, SummaryCache};
use crate::dir::remove_if_exists;
use crate::error::{CoreError, CoreResult};
use crate::record::{Record, Source, UniqueKey};
use crate::segment::Segment;
use crate::step::Step;
use crate::transaction::{Pending, Transaction};
use crate::types::TimeSpan;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-segment `.index` databases.
///
/// The index of a segment is updated in the same pending as its data, so
/// it is never stale with respect to the segment.
#[derive(Debug)]
pub struct SegmentedIndex {
    root: PathBuf,
    format: String,
    step: Step,
    unique: Vec<String>,
    cache: SummaryCache,
}

impl SegmentedIndex {
    /// Creates the index of the dataset at `root`.
    #[must_use]
    pub fn new(root: &Path, format: &str, step: Step, unique: Vec<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            format: format.to_string(),
            step,
            unique,
            cache: SummaryCache::new(root),
        }
    }

    fn abspath(&self, relpath: &str) -> PathBuf {
        self.root.join(relpath)
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> CoreResult<()> {
        let suffix = format!(".{}.index", self.format);
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
                if !name.ends_with(&format!(".{}", self.format)) {
                    self.walk(&entry.path(), &relpath, out)?;
                }
            } else if name.ends_with(&suffix) {
                if let Some(stripped) = relpath.strip_suffix(".index") {
                    out.push(stripped.to_string());
                }
            }
        }
        Ok(())
    }
}

impl DatasetIndex for SegmentedIndex {
    fn indexed_segments(&self) -> CoreResult<Vec<String>> {
        let mut out = Vec::new();
        if self.root.is_dir() {
            self.walk(&self.root, "", &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn segments_in_range(&self, span: Option<&TimeSpan>) -> CoreResult<Vec<String>> {
        let mut segments = self.indexed_segments()?;
        if let Some(span) = span {
            segments.retain(|relpath| {
                self.step
                    .timespan(relpath)
                    .map_or(true, |covered| covered.intersects(span))
            });
        }
        Ok(segments)
    }

    fn has_segment(&self, relpath: &str) -> CoreResult<bool> {
        Ok(index_path(&self.abspath(relpath)).is_file())
    }

    fn is_stale(&self, _segment: &dyn Segment) -> CoreResult<bool> {
        Ok(false)
    }

    fn segment_records(&self, relpath: &str) -> CoreResult<Vec<Record>> {
        self.query_segment(relpath, None)
    }

    fn query_segment(&self, relpath: &str, span: Option<&TimeSpan>) -> CoreResult<Vec<Record>> {
        match SegmentDb::open_existing(&self.abspath(relpath), relpath)? {
            Some(db) => db.records(&self.root, &self.format, span),
            None => Ok(Vec::new()),
        }
    }

    fn begin_update(&self, segment: Arc<dyn Segment>) -> CoreResult<Box<dyn IndexUpdate>> {
        let path = index_path(segment.abspath());
        let created = !path.exists();
        let db = SegmentDb::create(segment.abspath(), segment.relpath())?;
        let staged = SegmentedCommit {
            db: Some(db),
            path,
            created,
            cache: self.cache.clone(),
        };
        if let Some(db) = &staged.db {
            db.begin()?;
        }
        Ok(Box::new(SegmentedUpdate {
            staged,
            root: self.root.clone(),
            format: self.format.clone(),
            unique: self.unique.clone(),
        }))
    }

    fn remove_segment(&self, relpath: &str) -> CoreResult<()> {
        let path = index_path(&self.abspath(relpath));
        if remove_if_exists(&path)? {
            debug!(segment = relpath, "index removed");
        }
        remove_if_exists(&crate::dir::with_suffix(&path, "-journal"))?;
        self.cache.invalidate()
    }

    fn summary(&self, writable: bool) -> CoreResult<Summary> {
        if let Some(summary) = self.cache.read()? {
            return Ok(summary);
        }
        let mut summary = Summary::default();
        for relpath in self.indexed_segments()? {
            if let Some(db) = SegmentDb::open_existing(&self.abspath(&relpath), &relpath)? {
                summary.merge(&db.summary()?);
            }
        }
        if writable {
            self.cache.write(&summary)?;
        }
        Ok(summary)
    }

    fn vacuum(&self) -> CoreResult<()> {
        for relpath in self.indexed_segments()? {
            if let Some(db) = SegmentDb::open_existing(&self.abspath(&relpath), &relpath)? {
                db.vacuum()?;
            }
        }
        Ok(())
    }
}

struct SegmentedUpdate {
    staged: SegmentedCommit,
    root: PathBuf,
    format: String,
    unique: Vec<String>,
}

impl SegmentedUpdate {
    fn db(&self) -> CoreResult<&SegmentDb> {
        self.staged
            .db
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("index update already finished"))
    }
}

impl IndexUpdate for SegmentedUpdate {
    fn find_duplicate(&mut self, key: &UniqueKey) -> CoreResult<Option<Source>> {
        self.db()?.find(key, &self.root, &self.format)
    }

    fn remove(&mut self, key: &UniqueKey) -> CoreResult<()> {
        self.db()?.delete(key)
    }

    fn clear(&mut self) -> CoreResult<()> {
        self.db()?.clear()
    }

    fn insert(&mut self, record: &Record) -> CoreResult<()> {
        self.db()?.insert(record, &record.unique_key(&self.unique))
    }

    fn into_pending(self: Box<Self>) -> CoreResult<Pending> {
        let update = *self;
        Ok(Pending::new(Box::new(update.staged)))
    }
}

/// The open sqlite transaction of an update.
///
/// Dropped without commit it rolls back, removing an index file it created.
struct SegmentedCommit {
    db: Option<SegmentDb>,
    path: PathBuf,
    created: bool,
    cache: SummaryCache,
}

impl SegmentedCommit {
    fn discard(&mut self) -> CoreResult<()> {
        if let Some(db) = self.db.take() {
            db.rollback()?;
        }
        if self.created {
            self.created = false;
            remove_if_exists(&self.path)?;
        }
        Ok(())
    }
}

impl Transaction for SegmentedCommit {
    fn commit(&mut self) -> CoreResult<()> {
        if let Some(db) = &self.db {
            db.commit()?;
        }
        self.db = None;
        self.created = false;
        self.cache.invalidate()
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.discard()
    }
}

impl Drop for SegmentedCommit {
    fn drop(&mut self) {
        if let Err(e) = self.discard() {
            warn!(path = %self.path.display(), error = %e, "cannot discard index update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, Vm2Format};
    use crate::segment::ConcatSegment;
    use crate::types::parse_time;
    use tempfile::tempdir;

    fn setup(root: &Path) -> (SegmentedIndex, Arc<dyn Segment>) {
        let index = SegmentedIndex::new(root, "vm2", Step::Daily, Vm2Format.default_unique());
        let segment: Arc<dyn Segment> =
            Arc::new(ConcatSegment::new(root, "2007/07-08.vm2", Arc::new(Vm2Format)));
        (index, segment)
    }

    fn stored(segment: &Arc<dyn Segment>, time: &str, station: &str, offset: u64) -> Record {
        let mut r = Vm2Format::record(parse_time(time).unwrap(), station, "227", "1");
        r.source = Some(Source::new(
            "vm2",
            segment.abspath().parent().unwrap().parent().unwrap(),
            segment.relpath(),
            offset,
            23,
        ));
        r
    }

    #[test]
    fn committed_update_is_visible() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path());
        let mut update = index.begin_update(Arc::clone(&segment)).unwrap();
        update
            .insert(&stored(&segment, "2007-07-08 13:00:00", "1", 0))
            .unwrap();
        update.into_pending().unwrap().commit().unwrap();

        assert_eq!(index.indexed_segments().unwrap(), vec!["2007/07-08.vm2"]);
        assert!(index.has_segment("2007/07-08.vm2").unwrap());
        assert_eq!(index.segment_records("2007/07-08.vm2").unwrap().len(), 1);
        assert_eq!(index.summary(true).unwrap().count, 1);
        assert!(dir.path().join("summary").exists());

        let other = TimeSpan::instant(parse_time("2007-07-09 00:00:00").unwrap());
        assert!(index.segments_in_range(Some(&other)).unwrap().is_empty());
    }

    #[test]
    fn rolled_back_first_update_leaves_no_index() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path());
        let mut update = index.begin_update(Arc::clone(&segment)).unwrap();
        update
            .insert(&stored(&segment, "2007-07-08 13:00:00", "1", 0))
            .unwrap();
        drop(update.into_pending().unwrap());
        assert!(!index.has_segment("2007/07-08.vm2").unwrap());
    }

    #[test]
    fn abandoned_update_leaves_no_index() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path());
        let mut update = index.begin_update(Arc::clone(&segment)).unwrap();
        update
            .insert(&stored(&segment, "2007-07-08 13:00:00", "1", 0))
            .unwrap();
        drop(update);
        assert!(!index.has_segment("2007/07-08.vm2").unwrap());
    }

    #[test]
    fn duplicates_are_found_and_replaced() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path());
        let first = stored(&segment, "2007-07-08 13:00:00", "1", 0);
        index
            .reindex(Arc::clone(&segment), &[first.clone()])
            .unwrap()
            .commit()
            .unwrap();

        let second = stored(&segment, "2007-07-08 13:00:00", "1", 24);
        let key = second.unique_key(&Vm2Format.default_unique());
        let mut update = index.begin_update(Arc::clone(&segment)).unwrap();
        assert_eq!(update.find_duplicate(&key).unwrap(), first.source.clone());
        assert!(update.insert(&second).is_err());
        update.remove(&key).unwrap();
        update.insert(&second).unwrap();
        update.into_pending().unwrap().commit().unwrap();

        let records = index.segment_records("2007/07-08.vm2").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source.as_ref().unwrap().offset, 24);
    }

    #[test]
    fn remove_segment_is_idempotent() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path());
        let r = stored(&segment, "2007-07-08 13:00:00", "1", 0);
        index.reindex(Arc::clone(&segment), &[r]).unwrap().commit().unwrap();
        index.remove_segment("2007/07-08.vm2").unwrap();
        index.remove_segment("2007/07-08.vm2").unwrap();
        assert!(index.indexed_segments().unwrap().is_empty());
        assert_eq!(index.summary(false).unwrap(), Summary::default());
    }
}
