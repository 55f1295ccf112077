//! Appending and removing records.

use super::DatasetInner;
use crate::error::{CoreError, CoreResult};
use crate::index::Summary;
use crate::lock::{AppendLock, ReadLock};
use crate::record::{Record, Source};
use crate::transaction::{stage_append, Pending};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of [`Writer::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// Stored; the record's source is set.
    Ok,
    /// Rejected: a record with the same unique key exists.
    Duplicate,
    /// Rejected for another reason, which has been logged.
    Error,
}

/// An append holding its segment lock until committed or rolled back.
///
/// Dropping it rolls the append back.
#[derive(Debug)]
#[must_use = "dropping a PreparedAppend rolls it back"]
pub struct PreparedAppend {
    pending: Pending,
    source: Source,
    replaced: Option<Source>,
    _segment_lock: AppendLock,
    _dataset_lock: ReadLock,
}

impl PreparedAppend {
    /// Where the record will be stored.
    #[must_use]
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The record this one supersedes, if any.
    #[must_use]
    pub fn replaced(&self) -> Option<&Source> {
        self.replaced.as_ref()
    }

    /// Makes the append durable and visible to new queries.
    ///
    /// # Errors
    ///
    /// Returns the commit error; whatever was not yet committed is rolled
    /// back.
    pub fn commit(self) -> CoreResult<Source> {
        self.pending.commit()?;
        Ok(self.source)
    }

    /// Undoes the append.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be restored.
    pub fn rollback(self) -> CoreResult<()> {
        self.pending.rollback()
    }
}

/// Write access to a dataset.
#[derive(Debug, Clone)]
pub struct Writer {
    inner: Arc<DatasetInner>,
}

impl Writer {
    pub(crate) fn new(inner: Arc<DatasetInner>) -> Self {
        Self { inner }
    }

    /// Stages `record` in the segment of its reference time.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] under the `never` replace
    /// strategy, [`CoreError::LockConflict`] in non-blocking mode, a
    /// validation error for malformed bytes, or an I/O error.
    pub fn prepare(&self, record: &Record) -> CoreResult<PreparedAppend> {
        let reftime = record
            .reftime
            .ok_or_else(|| CoreError::corrupted("record has no reference time"))?;
        let relpath = self.inner.config.step.relpath(&reftime, self.inner.format.name());

        let dataset_lock = self.inner.locks.read(&self.inner.dataset_scope())?;
        let segment_lock = self.inner.locks.append(&self.inner.segment_scope(&relpath))?;
        let segment = self.inner.segments.get(&relpath);
        let staged = stage_append(
            self.inner.dir.root(),
            &segment,
            self.inner.index.as_ref(),
            record,
            &self.inner.unique,
            self.inner.config.replace,
        )?;
        Ok(PreparedAppend {
            pending: staged.pending,
            source: staged.source,
            replaced: staged.replaced,
            _segment_lock: segment_lock,
            _dataset_lock: dataset_lock,
        })
    }

    /// Appends and commits `record`, setting its source on success.
    pub fn acquire(&self, record: &mut Record) -> AcquireResult {
        match self.prepare(record).and_then(PreparedAppend::commit) {
            Ok(source) => {
                record.source = Some(source);
                AcquireResult::Ok
            }
            Err(CoreError::DuplicateKey { relpath }) => {
                debug!(dataset = %self.inner.config.name, segment = %relpath, "duplicate record rejected");
                AcquireResult::Duplicate
            }
            Err(e) => {
                warn!(dataset = %self.inner.config.name, error = %e, "cannot store record");
                AcquireResult::Error
            }
        }
    }

    /// Removes a stored record from the index, leaving its bytes as a hole
    /// for the next repack.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the index does not hold this
    /// record at its source.
    pub fn remove(&self, record: &Record) -> CoreResult<()> {
        let source = record.stored_source()?;
        let _dataset_lock = self.inner.locks.read(&self.inner.dataset_scope())?;
        let _segment_lock = self.inner.locks.append(&self.inner.segment_scope(&source.relpath))?;
        let segment = self.inner.segments.get(&source.relpath);

        let key = record.unique_key(&self.inner.unique);
        let mut update = self.inner.index.begin_update(segment)?;
        match update.find_duplicate(&key)? {
            Some(found) if found.relpath == source.relpath && found.offset == source.offset => {
                update.remove(&key)?;
                update.into_pending()?.commit()?;
                debug!(dataset = %self.inner.config.name, segment = %source.relpath, offset = source.offset, "record removed");
                Ok(())
            }
            _ => Err(CoreError::not_found(format!(
                "record at {}:{}",
                source.relpath, source.offset
            ))),
        }
    }

    /// Summary of the whole dataset, rebuilding the cache if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or the cache written.
    pub fn summary(&self) -> CoreResult<Summary> {
        let _lock = self.inner.locks.read(&self.inner.dataset_scope())?;
        self.inner.index.summary(true)
    }
}
