//! The maintenance engine: classifies segments and repairs them.
//!
//! [`Checker::segment_state`] compares what the index says about a segment
//! with what is on disk, first match winning:
//!
//! 1. no data on disk: MISSING if indexed, DELETED otherwise
//! 2. not indexed: UNALIGNED with an untrusted index, DELETED if the
//!    segment is empty, UNALIGNED otherwise
//! 3. index older than the data: UNALIGNED
//! 4. no records indexed: DELETED
//! 5. a record without reference time, a segment name that does not fit
//!    the step, or records outside the interval of the name: CORRUPTED
//! 6. the segment's own check; DIRTY under an untrusted index follows the
//!    configured [`UntrustedDirtyPolicy`]
//!
//! ARCHIVE_AGE or DELETE_AGE is then added from the end of the interval the
//! segment name covers.
//!
//! [`Checker::repack`] acts on DIRTY and aged segments, [`Checker::check`]
//! on UNALIGNED, MISSING and DELETED ones. Both only report when their
//! `write`/`fix` flag is false. Any unexpected failure while writing raises
//! the do-not-pack flag, which only a successful `check(fix = true)` clears.

mod report;

pub use report::{Action, MaintenanceReport, NullReporter, ReportEntry, ReportLog, Reporter};

use crate::clock::{Clock, SystemClock};
use crate::config::UntrustedDirtyPolicy;
use crate::dataset::{Archive, DatasetInner};
use crate::dir::{rename_if_exists, sync_directory, with_suffix, Flag};
use crate::error::{CoreError, CoreResult};
use crate::record::{Record, UniqueKey};
use crate::segment::{CompressedSegment, Segment, SegmentCheck, SegmentState};
use crate::transaction::Pending;
use crate::types::{merge_spans, TimeSpan};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Files that travel with a segment when it is archived.
const SEGMENT_FILES: [&str; 6] = ["", ".lz4", ".lz4.idx", ".index", ".metadata", ".summary"];

/// Runs scans, checks and repacks on one dataset.
#[derive(Debug, Clone)]
pub struct Checker {
    inner: Arc<DatasetInner>,
    clock: Arc<dyn Clock>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Checker {
    pub(crate) fn new(inner: Arc<DatasetInner>) -> Self {
        Self {
            inner,
            clock: Arc::new(SystemClock),
            cancel: None,
        }
    }

    /// Uses `clock` as the current time for age thresholds.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stops runs between segments once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Returns true if index offsets cannot be trusted.
    #[must_use]
    pub fn index_untrusted(&self) -> bool {
        self.inner.config.untrusted_index || self.inner.dir.has_flag(Flag::NeedsRebuild)
    }

    /// Relpaths found on disk or in the index, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset or the index cannot be read.
    pub fn segments(&self) -> CoreResult<Vec<String>> {
        let mut all: BTreeSet<String> = self.inner.segments.list()?.into_iter().collect();
        all.extend(self.inner.index.indexed_segments()?);
        Ok(all.into_iter().collect())
    }

    /// Computes the state of one segment.
    ///
    /// Quick mode skips record validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment or its index cannot be read.
    pub fn segment_state(&self, relpath: &str, quick: bool) -> CoreResult<SegmentCheck> {
        let segment = self.inner.segments.get(relpath);
        let mut result = self.structural_state(segment.as_ref(), quick)?;
        if !result.state.contains(SegmentState::MISSING) {
            result.state |= self.age_flags(relpath);
        }
        Ok(result)
    }

    fn structural_state(&self, segment: &dyn Segment, quick: bool) -> CoreResult<SegmentCheck> {
        let relpath = segment.relpath();
        let index = &self.inner.index;
        let indexed = index.has_segment(relpath)?;
        if !segment.exists() {
            return Ok(if indexed {
                SegmentCheck::with_note(SegmentState::MISSING, "segment is indexed but not on disk")
            } else {
                SegmentCheck::with_note(SegmentState::DELETED, "segment is gone")
            });
        }
        let untrusted = self.index_untrusted();
        if !indexed {
            if untrusted {
                return Ok(SegmentCheck::with_note(
                    SegmentState::UNALIGNED,
                    "segment is not indexed and the index needs rebuilding",
                ));
            }
            return Ok(if segment.size()? == 0 {
                SegmentCheck::with_note(SegmentState::DELETED, "empty segment with no index data")
            } else {
                SegmentCheck::with_note(
                    SegmentState::UNALIGNED,
                    "segment found on disk with no associated index data",
                )
            });
        }
        if index.is_stale(segment)? {
            return Ok(SegmentCheck::with_note(
                SegmentState::UNALIGNED,
                "index is older than the segment",
            ));
        }

        let records = index.segment_records(relpath)?;
        if records.is_empty() {
            return Ok(SegmentCheck::with_note(
                SegmentState::DELETED,
                "index knows of no data in the segment",
            ));
        }
        let Some(span) = records_span(&records) else {
            return Ok(SegmentCheck::with_note(
                SegmentState::CORRUPTED,
                "an indexed record has no reference time",
            ));
        };
        let Some(covered) = self.inner.config.step.timespan(relpath) else {
            return Ok(SegmentCheck::with_note(
                SegmentState::CORRUPTED,
                format!("segment name does not fit the {} step", self.inner.config.step),
            ));
        };
        if !covered.contains_span(&span) {
            return Ok(SegmentCheck::with_note(
                SegmentState::CORRUPTED,
                format!("segment contents ({span}) are outside the interval of its name ({covered})"),
            ));
        }

        let mut result = match segment.check(&records, quick) {
            Ok(result) => result,
            Err(CoreError::Corrupted { message }) => {
                SegmentCheck::with_note(SegmentState::CORRUPTED, message)
            }
            Err(e) => return Err(e),
        };
        if untrusted
            && result.state.contains(SegmentState::DIRTY)
            && self.inner.config.untrusted_dirty == UntrustedDirtyPolicy::Downgrade
        {
            result.state = result.state.downgrade_dirty();
            result
                .notes
                .push("index is untrusted: offsets need a rescan before repacking".into());
        }
        Ok(result)
    }

    fn age_flags(&self, relpath: &str) -> SegmentState {
        let Some(covered) = self.inner.config.step.timespan(relpath) else {
            return SegmentState::OK;
        };
        let now = self.clock.now();
        // A threshold reaching before the earliest representable time never
        // triggers.
        let older_than = |days: u32| {
            now.checked_sub_signed(chrono::Duration::days(i64::from(days)))
                .is_some_and(|limit| covered.end < limit)
        };
        if self.inner.config.delete_age.is_some_and(older_than) {
            SegmentState::DELETE_AGE
        } else if self.inner.config.archive_age.is_some_and(older_than) {
            SegmentState::ARCHIVE_AGE
        } else {
            SegmentState::OK
        }
    }

    /// Reports the state of every segment without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock cannot be taken or a segment cannot be
    /// read.
    pub fn scan(&self, reporter: &dyn Reporter, quick: bool) -> CoreResult<BTreeMap<String, SegmentState>> {
        let _lock = self.inner.locks.check(&self.inner.dataset_scope())?;
        let mut states = BTreeMap::new();
        for relpath in self.segments()? {
            if self.cancelled() {
                break;
            }
            let _segment_lock = self.inner.locks.check(&self.inner.segment_scope(&relpath))?;
            let result = self.segment_state(&relpath, quick)?;
            for note in &result.notes {
                reporter.segment_info(&relpath, note);
            }
            reporter.segment_state(&relpath, result.state);
            states.insert(relpath, result.state);
        }
        Ok(states)
    }

    /// Repacks dirty segments and applies age thresholds.
    ///
    /// With `write` false, the actions are reported but not performed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NeedsCheck`] if `write` is set and the dataset
    /// carries the do-not-pack flag, or the first failure, after raising
    /// that flag.
    pub fn repack(&self, reporter: &dyn Reporter, write: bool) -> CoreResult<MaintenanceReport> {
        let _lock = self.inner.locks.check(&self.inner.dataset_scope())?;
        if self.inner.dir.has_flag(Flag::DoNotPack) {
            if write {
                return Err(CoreError::NeedsCheck {
                    path: self.inner.dir.root().to_path_buf(),
                });
            }
            reporter.segment_info(self.name(), "dataset needs a check before it can be repacked");
        }

        let mut report = MaintenanceReport::default();
        for relpath in self.segments()? {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            report.segments += 1;
            if let Err(e) = self.repack_one(&relpath, reporter, write, &mut report) {
                if write {
                    self.raise_do_not_pack(&relpath, &e);
                }
                return Err(e);
            }
        }
        info!(dataset = self.name(), write, report = %report, "repack finished");
        Ok(report)
    }

    fn repack_one(
        &self,
        relpath: &str,
        reporter: &dyn Reporter,
        write: bool,
        report: &mut MaintenanceReport,
    ) -> CoreResult<()> {
        let mut lock = self.inner.locks.check(&self.inner.segment_scope(relpath))?;
        let _write = if write { Some(lock.write_lock()?) } else { None };

        let state = self.segment_state(relpath, true)?.state;
        reporter.segment_state(relpath, state);
        let segment = self.inner.segments.get(relpath);
        let structural = state.structural();
        let trusted = [SegmentState::OK, SegmentState::DIRTY, SegmentState::DELETED]
            .contains(&structural);
        let simulated = !write;

        if state.contains(SegmentState::DELETE_AGE) && trusted && segment.exists() {
            let freed = if write {
                self.delete_segment(segment.as_ref())?
            } else {
                segment.size()?
            };
            self.acted(reporter, report, relpath, Action::Deleted, simulated, format!("{freed} bytes freed"));
            if write {
                report.bytes_freed += freed;
            }
        } else if structural == SegmentState::DIRTY {
            if write {
                let freed = self.repack_segment(&segment)?;
                report.bytes_freed += freed;
                self.acted(reporter, report, relpath, Action::Repacked, false, format!("{freed} bytes freed"));
            } else {
                self.acted(reporter, report, relpath, Action::Repacked, true, "segment has holes or is out of order".into());
            }
            if state.contains(SegmentState::ARCHIVE_AGE) {
                if write {
                    self.archive_segment(segment.as_ref())?;
                }
                self.acted(reporter, report, relpath, Action::Archived, simulated, "segment is old enough to archive".into());
            }
        } else if structural.is_ok() && state.contains(SegmentState::ARCHIVE_AGE) {
            if write {
                self.archive_segment(segment.as_ref())?;
            }
            self.acted(reporter, report, relpath, Action::Archived, simulated, "segment is old enough to archive".into());
        } else if structural == SegmentState::DELETED && segment.exists() {
            let freed = if write {
                self.delete_segment(segment.as_ref())?
            } else {
                segment.size()?
            };
            self.acted(reporter, report, relpath, Action::Deleted, simulated, format!("no live data left, {freed} bytes freed"));
            if write {
                report.bytes_freed += freed;
            }
        } else if !trusted {
            reporter.segment_info(relpath, &format!("segment is {structural}: run a check first"));
        }
        Ok(())
    }

    /// Repairs segments whose index disagrees with the data.
    ///
    /// With `fix` false, the repairs are reported but not performed. A
    /// successful fix that leaves nothing for an operator clears the
    /// do-not-pack and needs-rebuild flags.
    ///
    /// # Errors
    ///
    /// Returns the first unexpected failure, after raising the do-not-pack
    /// flag. Segments needing manual intervention are reported and do not
    /// stop the run.
    pub fn check(&self, reporter: &dyn Reporter, fix: bool, quick: bool) -> CoreResult<MaintenanceReport> {
        let _lock = self.inner.locks.check(&self.inner.dataset_scope())?;
        let mut report = MaintenanceReport::default();
        let mut unresolved = false;
        for relpath in self.segments()? {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            report.segments += 1;
            match self.check_one(&relpath, reporter, fix, quick, &mut report) {
                Ok(resolved) => unresolved |= !resolved,
                Err(CoreError::Corrupted { message }) => {
                    unresolved = true;
                    self.acted(reporter, &mut report, &relpath, Action::ManualIntervention, true, message.clone());
                    if fix {
                        self.raise_do_not_pack(&relpath, &CoreError::Corrupted { message });
                    }
                }
                Err(e) => {
                    if fix {
                        self.raise_do_not_pack(&relpath, &e);
                    }
                    return Err(e);
                }
            }
        }
        if fix && !unresolved && !report.cancelled {
            self.inner.dir.clear_flag(Flag::DoNotPack)?;
            self.inner.dir.clear_flag(Flag::NeedsRebuild)?;
        }
        info!(dataset = self.name(), fix, report = %report, "check finished");
        Ok(report)
    }

    /// Returns false if the segment still needs an operator.
    fn check_one(
        &self,
        relpath: &str,
        reporter: &dyn Reporter,
        fix: bool,
        quick: bool,
        report: &mut MaintenanceReport,
    ) -> CoreResult<bool> {
        let mut lock = self.inner.locks.check(&self.inner.segment_scope(relpath))?;
        let _write = if fix { Some(lock.write_lock()?) } else { None };

        let result = self.segment_state(relpath, quick)?;
        for note in &result.notes {
            reporter.segment_info(relpath, note);
        }
        reporter.segment_state(relpath, result.state);
        let structural = result.state.structural();
        let segment = self.inner.segments.get(relpath);
        let simulated = !fix;

        if structural.contains(SegmentState::CORRUPTED) {
            let message = result.notes.join("; ");
            self.acted(reporter, report, relpath, Action::ManualIntervention, true, message);
            return Ok(false);
        }
        if structural.contains(SegmentState::MISSING) {
            if fix {
                self.inner.index.remove_segment(relpath)?;
            }
            self.acted(reporter, report, relpath, Action::Deindexed, simulated, "segment data is gone".into());
        } else if structural.contains(SegmentState::UNALIGNED) {
            let message = if fix {
                format!("{} records found", self.rescan_segment(&segment)?)
            } else {
                "segment needs to be rescanned".into()
            };
            self.acted(reporter, report, relpath, Action::Rescanned, simulated, message);
        } else if structural == SegmentState::DELETED {
            if !segment.exists() && self.inner.index.has_segment(relpath)? {
                if fix {
                    self.inner.index.remove_segment(relpath)?;
                }
                self.acted(reporter, report, relpath, Action::Deindexed, simulated, "segment data is gone".into());
            } else if segment.exists() {
                reporter.segment_info(relpath, "segment has no live data: a repack will remove it");
            }
        } else if structural == SegmentState::DIRTY {
            reporter.segment_info(relpath, "segment should be repacked");
        }
        Ok(true)
    }

    /// Rewrites every clean segment not yet compressed as lz4 blocks of
    /// `group_size` records.
    ///
    /// Segments that need a check or a repack are reported and skipped.
    ///
    /// # Errors
    ///
    /// Returns the first failure, after raising the do-not-pack flag.
    pub fn compress(&self, reporter: &dyn Reporter, group_size: usize) -> CoreResult<MaintenanceReport> {
        let _lock = self.inner.locks.check(&self.inner.dataset_scope())?;
        let mut report = MaintenanceReport::default();
        for relpath in self.segments()? {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            report.segments += 1;
            if let Err(e) = self.compress_one(&relpath, reporter, group_size, &mut report) {
                self.raise_do_not_pack(&relpath, &e);
                return Err(e);
            }
        }
        info!(dataset = self.name(), group_size, report = %report, "compress finished");
        Ok(report)
    }

    fn compress_one(
        &self,
        relpath: &str,
        reporter: &dyn Reporter,
        group_size: usize,
        report: &mut MaintenanceReport,
    ) -> CoreResult<()> {
        let segment = self.inner.segments.get(relpath);
        if with_suffix(segment.abspath(), ".lz4").exists() {
            return Ok(());
        }
        let mut lock = self.inner.locks.check(&self.inner.segment_scope(relpath))?;
        let _write = lock.write_lock()?;

        let state = self.segment_state(relpath, true)?.state;
        reporter.segment_state(relpath, state);
        if !state.structural().is_ok() {
            reporter.segment_info(relpath, &format!("segment is {}: not compressed", state.structural()));
            return Ok(());
        }

        let mut records = self.inner.index.segment_records(relpath)?;
        records.sort_by_key(|r| r.source.as_ref().map_or(0, |s| s.offset));
        let before = segment.size()?;
        let target = CompressedSegment::new(
            self.inner.dir.root(),
            relpath,
            Arc::clone(segment.format()),
            group_size,
        );
        let data = target.compress_from(Arc::clone(&segment), &mut records)?;
        let target: Arc<dyn Segment> = Arc::new(target);
        let index = self.inner.index.reindex(Arc::clone(&target), &records)?;
        Pending::chain(data, index).commit()?;

        let after = target.size()?;
        self.acted(
            reporter,
            report,
            relpath,
            Action::Compressed,
            false,
            format!("{before} bytes compressed to {after}"),
        );
        report.bytes_freed += before.saturating_sub(after);
        Ok(())
    }

    /// Compacts index storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or compaction fails.
    pub fn vacuum(&self) -> CoreResult<()> {
        let _lock = self.inner.locks.check(&self.inner.dataset_scope())?;
        self.inner.index.vacuum()
    }

    fn acted(
        &self,
        reporter: &dyn Reporter,
        report: &mut MaintenanceReport,
        relpath: &str,
        action: Action,
        simulated: bool,
        message: String,
    ) {
        if !simulated {
            info!(dataset = self.name(), segment = relpath, action = %action, "{message}");
        }
        reporter.segment_action(relpath, action, simulated, &message);
        report.record(action);
    }

    fn raise_do_not_pack(&self, relpath: &str, err: &CoreError) {
        if err.is_lock_conflict() {
            return;
        }
        warn!(dataset = self.name(), segment = relpath, error = %err, "maintenance failed, raising do-not-pack flag");
        if let Err(e) = self.inner.dir.set_flag(Flag::DoNotPack) {
            warn!(dataset = self.name(), error = %e, "cannot raise do-not-pack flag");
        }
    }

    /// Rewrites a segment in index order, returning the bytes freed.
    fn repack_segment(&self, segment: &Arc<dyn Segment>) -> CoreResult<u64> {
        let relpath = segment.relpath();
        let mut records = self.inner.index.segment_records(relpath)?;
        let before = segment.size()?;
        let data = segment.repack(&mut records, true)?;
        let index = self.inner.index.reindex(Arc::clone(segment), &records)?;
        Pending::chain(data, index).commit()?;
        let freed = before.saturating_sub(segment.size()?);
        debug!(segment = relpath, before, freed, "segment repacked");
        Ok(freed)
    }

    /// Rebuilds the index of a segment from its contents.
    ///
    /// Later records win over earlier ones with the same unique key.
    fn rescan_segment(&self, segment: &Arc<dyn Segment>) -> CoreResult<usize> {
        let relpath = segment.relpath();
        let covered = self.inner.config.step.timespan(relpath).ok_or_else(|| {
            CoreError::corrupted(format!(
                "{relpath}: name does not fit the {} step: manual fix is required",
                self.inner.config.step
            ))
        })?;

        let mut positions: HashMap<UniqueKey, usize> = HashMap::new();
        let mut records: Vec<Record> = Vec::new();
        for record in segment.scan()? {
            let offset = record.source.as_ref().map_or(0, |s| s.offset);
            let Some(reftime) = record.reftime else {
                return Err(CoreError::corrupted(format!(
                    "{relpath}: record at offset {offset} has no reference time: manual fix is required"
                )));
            };
            if !covered.contains(&reftime) {
                return Err(CoreError::corrupted(format!(
                    "{relpath}: record at offset {offset} has reference time {} outside {covered}: manual fix is required",
                    crate::types::format_time(&reftime)
                )));
            }
            match positions.get(&record.unique_key(&self.inner.unique)) {
                Some(&i) => records[i] = record,
                None => {
                    positions.insert(record.unique_key(&self.inner.unique), records.len());
                    records.push(record);
                }
            }
        }
        self.inner
            .index
            .reindex(Arc::clone(segment), &records)?
            .commit()?;
        Ok(records.len())
    }

    fn delete_segment(&self, segment: &dyn Segment) -> CoreResult<u64> {
        let freed = segment.remove()?;
        self.inner.index.remove_segment(segment.relpath())?;
        Ok(freed)
    }

    fn archive_segment(&self, segment: &dyn Segment) -> CoreResult<()> {
        let relpath = segment.relpath();
        let records = self.inner.index.segment_records(relpath)?;
        let dest = self.inner.dir.archive_path(relpath);
        for suffix in SEGMENT_FILES {
            let target = with_suffix(&dest, suffix);
            if target.exists() {
                return Err(CoreError::invalid_operation(format!(
                    "cannot archive {relpath}: {} already exists",
                    target.display()
                )));
            }
        }
        let parent = dest
            .parent()
            .ok_or_else(|| CoreError::invalid_operation(format!("cannot archive {relpath}")))?;
        fs::create_dir_all(parent)?;
        for suffix in SEGMENT_FILES {
            rename_if_exists(&with_suffix(segment.abspath(), suffix), &with_suffix(&dest, suffix))?;
        }
        sync_directory(parent)?;
        Archive::create(&self.inner)?.index_segment(relpath, &records)?;
        self.inner.index.remove_segment(relpath)
    }

    fn with_records<F>(&self, relpath: &str, f: F) -> CoreResult<()>
    where
        F: FnOnce(&Arc<dyn Segment>, &mut Vec<Record>) -> CoreResult<bool>,
    {
        let _lock = self.inner.locks.write(&self.inner.segment_scope(relpath))?;
        let segment = self.inner.segments.get(relpath);
        let mut records = self.inner.index.segment_records(relpath)?;
        records.sort_by_key(|r| r.source.as_ref().map_or(0, |s| s.offset));
        if f(&segment, &mut records)? {
            self.inner
                .index
                .reindex(Arc::clone(&segment), &records)?
                .commit()?;
        }
        Ok(())
    }

    /// Fault injection: inserts `size` bytes of garbage before record
    /// `index` (in offset order) and reindexes the shifted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten.
    pub fn make_hole(&self, relpath: &str, index: usize, size: u64) -> CoreResult<()> {
        self.with_records(relpath, |segment, records| {
            segment.make_hole(records, index, size)?;
            Ok(true)
        })
    }

    /// Fault injection: moves record `index` onwards back by `overlap`
    /// bytes and reindexes them.
    ///
    /// # Errors
    ///
    /// Returns an error for the first record or if the segment cannot be
    /// rewritten.
    pub fn make_overlap(&self, relpath: &str, index: usize, overlap: u64) -> CoreResult<()> {
        self.with_records(relpath, |segment, records| {
            segment.make_overlap(records, index, overlap)?;
            Ok(true)
        })
    }

    /// Fault injection: damages record `index` so that validation fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten.
    pub fn corrupt(&self, relpath: &str, index: usize) -> CoreResult<()> {
        self.with_records(relpath, |segment, records| {
            segment.corrupt(records, index)?;
            Ok(false)
        })
    }

    /// Fault injection: cuts the segment at `offset`, keeping its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is shorter than `offset`.
    pub fn truncate(&self, relpath: &str, offset: u64) -> CoreResult<()> {
        self.with_records(relpath, |segment, _| {
            segment.truncate(offset)?;
            Ok(false)
        })
    }

    /// Fault injection: forgets the index data of a segment, keeping its
    /// data.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be updated.
    pub fn remove_index(&self, relpath: &str) -> CoreResult<()> {
        let _lock = self.inner.locks.write(&self.inner.segment_scope(relpath))?;
        self.inner.index.remove_segment(relpath)
    }
}

fn records_span(records: &[Record]) -> Option<TimeSpan> {
    let mut span = None;
    for record in records {
        span = merge_spans(span, TimeSpan::instant(record.reftime?));
    }
    span
}
