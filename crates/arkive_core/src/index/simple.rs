//! Index made of a dataset-wide manifest plus per-segment sidecars.

use super::manifest::{open_manifest, Manifest, ManifestEntry};
use super::{sidecar, DatasetIndex, IndexUpdate, Summary, SummaryCache};
use crate::config::IndexKind;
use crate::dir;
use crate::error::{CoreError, CoreResult};
use crate::lock::IndexLock;
use crate::record::{sort_index_order, Record, Source, UniqueKey};
use crate::segment::Segment;
use crate::step::Step;
use crate::transaction::{Pending, Transaction};
use crate::types::{merge_spans, TimeSpan};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

type SharedManifest = Arc<Mutex<Box<dyn Manifest>>>;

/// Manifest-based index.
///
/// A segment is stale when its modification time differs from the one in
/// the manifest, or when its sidecars are older than the data they
/// describe.
#[derive(Debug)]
pub struct SimpleIndex {
    root: PathBuf,
    step: Step,
    unique: Vec<String>,
    manifest: SharedManifest,
    cache: SummaryCache,
}

impl SimpleIndex {
    /// Opens the plain or sqlite manifest of the dataset at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for [`IndexKind::PerSegment`],
    /// or an error opening the manifest.
    pub fn open(root: &Path, kind: IndexKind, step: Step, unique: Vec<String>) -> CoreResult<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            step,
            unique,
            manifest: Arc::new(Mutex::new(open_manifest(root, kind)?)),
            cache: SummaryCache::new(root),
        })
    }

    fn abspath(&self, relpath: &str) -> PathBuf {
        self.root.join(relpath)
    }
}

impl DatasetIndex for SimpleIndex {
    fn indexed_segments(&self) -> CoreResult<Vec<String>> {
        Ok(self
            .manifest
            .lock()
            .entries()?
            .into_iter()
            .map(|e| e.relpath)
            .collect())
    }

    fn segments_in_range(&self, span: Option<&TimeSpan>) -> CoreResult<Vec<String>> {
        self.manifest.lock().segments_in_range(span)
    }

    fn has_segment(&self, relpath: &str) -> CoreResult<bool> {
        Ok(self.manifest.lock().get(relpath)?.is_some())
    }

    fn is_stale(&self, segment: &dyn Segment) -> CoreResult<bool> {
        let Some(entry) = self.manifest.lock().get(segment.relpath())? else {
            return Ok(true);
        };
        let data_mtime = segment.mtime()?;
        if entry.mtime != data_mtime {
            debug!(segment = segment.relpath(), indexed = entry.mtime, actual = data_mtime, "modification time changed");
            return Ok(true);
        }
        let Some(metadata) = dir::mtime_if_exists(&sidecar::metadata_path(segment.abspath()))? else {
            return Ok(true);
        };
        if metadata < data_mtime {
            return Ok(true);
        }
        let summary = dir::mtime_if_exists(&sidecar::summary_path(segment.abspath()))?;
        Ok(summary.map_or(true, |summary| summary < metadata))
    }

    fn segment_records(&self, relpath: &str) -> CoreResult<Vec<Record>> {
        let mut records =
            sidecar::read_metadata(&self.abspath(relpath), &self.root)?.unwrap_or_default();
        sort_index_order(&mut records);
        Ok(records)
    }

    fn begin_update(&self, segment: Arc<dyn Segment>) -> CoreResult<Box<dyn IndexUpdate>> {
        let records = sidecar::read_metadata(segment.abspath(), &self.root)?.unwrap_or_default();
        Ok(Box::new(SimpleUpdate {
            segment,
            root: self.root.clone(),
            step: self.step,
            unique: self.unique.clone(),
            records,
            manifest: Arc::clone(&self.manifest),
            cache: self.cache.clone(),
        }))
    }

    fn remove_segment(&self, relpath: &str) -> CoreResult<()> {
        {
            let _lock = IndexLock::acquire(&self.root)?;
            let mut manifest = self.manifest.lock();
            manifest.remove(relpath)?;
            manifest.flush()?;
        }
        sidecar::remove(&self.abspath(relpath))?;
        self.cache.invalidate()
    }

    fn summary(&self, writable: bool) -> CoreResult<Summary> {
        if let Some(summary) = self.cache.read()? {
            return Ok(summary);
        }
        let mut summary = Summary::default();
        for relpath in self.indexed_segments()? {
            let abspath = self.abspath(&relpath);
            match sidecar::read_summary(&abspath)? {
                Some(segment) => summary.merge(&segment),
                None => summary.merge(&Summary::of(&self.segment_records(&relpath)?)),
            }
        }
        if writable {
            self.cache.write(&summary)?;
        }
        Ok(summary)
    }

    fn vacuum(&self) -> CoreResult<()> {
        let _lock = IndexLock::acquire(&self.root)?;
        self.manifest.lock().vacuum()
    }
}

/// Record list of one segment, edited in memory until committed.
struct SimpleUpdate {
    segment: Arc<dyn Segment>,
    root: PathBuf,
    step: Step,
    unique: Vec<String>,
    records: Vec<Record>,
    manifest: SharedManifest,
    cache: SummaryCache,
}

impl SimpleUpdate {
    fn position(&self, key: &UniqueKey) -> Option<usize> {
        self.records
            .iter()
            .position(|r| &r.unique_key(&self.unique) == key)
    }

    /// Stores `entry` in the manifest, putting the previous entry back if
    /// the manifest cannot be flushed.
    fn publish(&self, entry: ManifestEntry) -> CoreResult<()> {
        let _lock = IndexLock::acquire(&self.root)?;
        let mut manifest = self.manifest.lock();
        let relpath = entry.relpath.clone();
        let previous = manifest.get(&relpath)?;
        manifest.acquire(entry)?;
        if let Err(e) = manifest.flush() {
            let restored = match previous {
                Some(previous) => manifest.acquire(previous),
                None => manifest.remove(&relpath),
            };
            if let Err(restore) = restored {
                warn!(segment = %relpath, error = %restore, "cannot restore manifest entry");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl IndexUpdate for SimpleUpdate {
    fn find_duplicate(&mut self, key: &UniqueKey) -> CoreResult<Option<Source>> {
        Ok(self
            .position(key)
            .and_then(|i| self.records[i].source.clone()))
    }

    fn remove(&mut self, key: &UniqueKey) -> CoreResult<()> {
        if let Some(i) = self.position(key) {
            self.records.remove(i);
        }
        Ok(())
    }

    fn clear(&mut self) -> CoreResult<()> {
        self.records.clear();
        Ok(())
    }

    fn insert(&mut self, record: &Record) -> CoreResult<()> {
        record.stored_source()?;
        if record.reftime.is_none() {
            return Err(CoreError::corrupted("cannot index a record without reference time"));
        }
        if self.position(&record.unique_key(&self.unique)).is_some() {
            return Err(CoreError::DuplicateKey {
                relpath: self.segment.relpath().to_string(),
            });
        }
        self.records.push(record.without_data());
        Ok(())
    }

    fn into_pending(self: Box<Self>) -> CoreResult<Pending> {
        Ok(Pending::new(self))
    }
}

impl Transaction for SimpleUpdate {
    fn commit(&mut self) -> CoreResult<()> {
        sort_index_order(&mut self.records);
        let relpath = self.segment.relpath();
        let span = self
            .records
            .iter()
            .filter_map(|r| r.reftime.map(TimeSpan::instant))
            .fold(None, merge_spans)
            .or_else(|| self.step.timespan(relpath))
            .ok_or_else(|| {
                CoreError::corrupted(format!("segment name {relpath} does not fit the dataset step"))
            })?;
        let entry = ManifestEntry {
            relpath: relpath.to_string(),
            mtime: self.segment.mtime()?,
            span,
        };

        let backup = sidecar::SidecarBackup::of(self.segment.abspath())?;
        let written = sidecar::write(self.segment.abspath(), &self.records)
            .and_then(|()| self.publish(entry));
        if let Err(e) = written {
            if let Err(restore) = backup.restore() {
                warn!(segment = relpath, error = %restore, "cannot restore sidecars after failed index commit");
            }
            return Err(e);
        }
        debug!(segment = relpath, count = self.records.len(), "segment indexed");
        self.cache.invalidate()
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, Vm2Format};
    use crate::segment::ConcatSegment;
    use crate::types::parse_time;
    use tempfile::tempdir;

    fn append(segment: &Arc<dyn Segment>, time: &str, station: &str) -> Record {
        let line = Vm2Format::line(&parse_time(time).unwrap(), station, "227", "1");
        let appended = segment.append(line.as_bytes()).unwrap();
        appended.pending.commit().unwrap();
        let mut record = Vm2Format.parse(line.as_bytes()).unwrap();
        record.source = Some(Source::new(
            "vm2",
            segment.abspath().parent().unwrap().parent().unwrap(),
            segment.relpath(),
            appended.offset,
            line.len() as u64,
        ));
        record
    }

    fn setup(root: &Path, kind: IndexKind) -> (SimpleIndex, Arc<dyn Segment>) {
        let index = SimpleIndex::open(root, kind, Step::Daily, Vm2Format.default_unique()).unwrap();
        let segment: Arc<dyn Segment> =
            Arc::new(ConcatSegment::new(root, "2007/07-08.vm2", Arc::new(Vm2Format)));
        (index, segment)
    }

    #[test]
    fn commit_writes_sidecars_and_manifest() {
        for kind in [IndexKind::Plain, IndexKind::Sqlite] {
            let dir = tempdir().unwrap();
            let (index, segment) = setup(dir.path(), kind);
            let b = append(&segment, "2007-07-08 14:00:00", "1");
            let a = append(&segment, "2007-07-08 13:00:00", "1");
            index
                .reindex(Arc::clone(&segment), &[b, a])
                .unwrap()
                .commit()
                .unwrap();

            assert_eq!(index.indexed_segments().unwrap(), vec!["2007/07-08.vm2"]);
            assert!(!index.is_stale(segment.as_ref()).unwrap());
            let records = index.segment_records("2007/07-08.vm2").unwrap();
            let offsets: Vec<u64> = records.iter().map(|r| r.source.as_ref().unwrap().offset).collect();
            assert_eq!(offsets, vec![23, 0]);
            assert_eq!(index.summary(true).unwrap().count, 2);
        }
    }

    #[test]
    fn dropped_update_changes_nothing() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path(), IndexKind::Plain);
        let a = append(&segment, "2007-07-08 13:00:00", "1");
        let mut update = index.begin_update(Arc::clone(&segment)).unwrap();
        update.insert(&a).unwrap();
        drop(update.into_pending().unwrap());
        assert!(!index.has_segment("2007/07-08.vm2").unwrap());
        assert!(!sidecar::metadata_path(segment.abspath()).exists());
    }

    #[test]
    fn missing_sidecar_makes_segment_stale() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path(), IndexKind::Plain);
        let a = append(&segment, "2007-07-08 13:00:00", "1");
        index.reindex(Arc::clone(&segment), &[a]).unwrap().commit().unwrap();
        std::fs::remove_file(sidecar::summary_path(segment.abspath())).unwrap();
        assert!(index.is_stale(segment.as_ref()).unwrap());
    }

    #[test]
    fn changed_mtime_makes_segment_stale() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path(), IndexKind::Sqlite);
        let a = append(&segment, "2007-07-08 13:00:00", "1");
        index.reindex(Arc::clone(&segment), &[a]).unwrap().commit().unwrap();
        let mtime = segment.mtime().unwrap();
        dir::set_mtime(segment.abspath(), mtime - 100).unwrap();
        assert!(index.is_stale(segment.as_ref()).unwrap());
    }

    #[test]
    fn duplicates_and_removal() {
        let dir = tempdir().unwrap();
        let (index, segment) = setup(dir.path(), IndexKind::Plain);
        let a = append(&segment, "2007-07-08 13:00:00", "1");
        index.reindex(Arc::clone(&segment), &[a.clone()]).unwrap().commit().unwrap();

        let again = append(&segment, "2007-07-08 13:00:00", "1");
        let key = again.unique_key(&Vm2Format.default_unique());
        let mut update = index.begin_update(Arc::clone(&segment)).unwrap();
        assert_eq!(update.find_duplicate(&key).unwrap(), a.source);
        assert!(matches!(update.insert(&again), Err(CoreError::DuplicateKey { .. })));
        drop(update);

        index.remove_segment("2007/07-08.vm2").unwrap();
        index.remove_segment("2007/07-08.vm2").unwrap();
        assert!(index.indexed_segments().unwrap().is_empty());
        assert!(!sidecar::metadata_path(segment.abspath()).exists());
        assert_eq!(index.summary(false).unwrap().count, 0);
    }
}
