//! Indexes mapping time ranges to segments and segments to records.
//!
//! [`SimpleIndex`] keeps one dataset-wide manifest (plain text or sqlite)
//! plus `.metadata`/`.summary` sidecars next to each segment.
//! [`SegmentedIndex`] keeps a small sqlite database next to each segment
//! and answers record queries without a dataset-wide file.
//!
//! Every mutation goes through an [`IndexUpdate`] turned into a
//! [`Pending`], so readers never observe a half-applied change.

pub mod manifest;
mod segment_db;
mod segmented;
pub mod sidecar;
mod simple;
mod summary;

pub use manifest::{Manifest, ManifestEntry, PlainManifest, SqliteManifest};
pub use segmented::SegmentedIndex;
pub use simple::SimpleIndex;
pub use summary::{Summary, SummaryCache};

use crate::error::CoreResult;
use crate::record::{Record, Source, UniqueKey};
use crate::segment::Segment;
use crate::transaction::Pending;
use crate::types::TimeSpan;
use std::fmt::Debug;
use std::sync::Arc;

/// Index of a dataset.
pub trait DatasetIndex: Send + Sync + Debug {
    /// Relpaths of all indexed segments, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn indexed_segments(&self) -> CoreResult<Vec<String>>;

    /// Relpaths of the segments that may hold records in `span`, sorted.
    /// `None` selects every segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn segments_in_range(&self, span: Option<&TimeSpan>) -> CoreResult<Vec<String>>;

    /// Returns true if the segment has index data.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn has_segment(&self, relpath: &str) -> CoreResult<bool>;

    /// Returns true if the segment changed since it was indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the index or the segment cannot be inspected.
    fn is_stale(&self, segment: &dyn Segment) -> CoreResult<bool>;

    /// Records indexed for a segment, by reference time then offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn segment_records(&self, relpath: &str) -> CoreResult<Vec<Record>>;

    /// Records of a segment whose reference time falls in `span`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn query_segment(&self, relpath: &str, span: Option<&TimeSpan>) -> CoreResult<Vec<Record>> {
        let mut records = self.segment_records(relpath)?;
        if let Some(span) = span {
            records.retain(|r| r.reftime.is_some_and(|t| span.contains(&t)));
        }
        Ok(records)
    }

    /// Starts a change to the records of one segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be opened for writing.
    fn begin_update(&self, segment: Arc<dyn Segment>) -> CoreResult<Box<dyn IndexUpdate>>;

    /// Replaces everything indexed for `segment` with `records`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be opened for writing.
    fn reindex(&self, segment: Arc<dyn Segment>, records: &[Record]) -> CoreResult<Pending> {
        let mut update = self.begin_update(segment)?;
        update.clear()?;
        for record in records {
            update.insert(record)?;
        }
        update.into_pending()
    }

    /// Forgets a segment. Removing an unknown segment is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be updated.
    fn remove_segment(&self, relpath: &str) -> CoreResult<()>;

    /// Summary of the whole dataset.
    ///
    /// With `writable`, a missing cache is rebuilt and stored; otherwise it
    /// is computed without being persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn summary(&self, writable: bool) -> CoreResult<Summary>;

    /// Compacts index storage.
    ///
    /// # Errors
    ///
    /// Returns an error if compaction fails.
    fn vacuum(&self) -> CoreResult<()>;
}

/// Changes to the records of one segment, applied when committed.
pub trait IndexUpdate: Send {
    /// Looks for a record with the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn find_duplicate(&mut self, key: &UniqueKey) -> CoreResult<Option<Source>>;

    /// Drops the record with the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be updated.
    fn remove(&mut self, key: &UniqueKey) -> CoreResult<()>;

    /// Drops every record of the segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be updated.
    fn clear(&mut self) -> CoreResult<()>;

    /// Adds a record, which must carry its source.
    ///
    /// # Errors
    ///
    /// Returns an error if the record has no source or reference time, or
    /// its key is already present.
    fn insert(&mut self, record: &Record) -> CoreResult<()>;

    /// Turns the changes into a pending commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the changes cannot be staged.
    fn into_pending(self: Box<Self>) -> CoreResult<Pending>;
}
