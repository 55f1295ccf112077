//! Segment storage.
//!
//! A segment holds the records of one time step, in one of three on-disk
//! kinds:
//!
//! - [`ConcatSegment`]: records concatenated in a single file, each
//!   followed by the format's padding
//! - [`DirSegment`]: one member file per record, numbered by a sequence
//! - [`CompressedSegment`]: lz4 blocks holding one or more records, plus a
//!   block index when there is more than one block
//!
//! Every kind supports the same operations so that writers and the
//! maintenance engine never need to know which one they are handling.

mod check;
mod compressed;
mod concat;
mod dir;
mod mischief;
mod state;

pub use compressed::CompressedSegment;
pub use concat::ConcatSegment;
pub use dir::DirSegment;
pub use state::SegmentState;

use crate::config::SegmentKind;
use crate::dir::{with_suffix, DatasetDir, SEQUENCE_FILE};
use crate::error::{CoreError, CoreResult};
use crate::format::Format;
use crate::record::{Record, Source};
use crate::transaction::Pending;
use arkive_storage::{StorageBackend, StorageError};
use bytes::Bytes;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Result of an append: where the bytes went, and how to make them stick.
#[derive(Debug)]
pub struct Appended {
    /// Offset of the new record.
    pub offset: u64,
    /// Commit syncs the data; rollback restores the previous segment size.
    pub pending: Pending,
}

/// Outcome of checking a segment against its index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentCheck {
    /// Structural state found.
    pub state: SegmentState,
    /// Human-readable findings.
    pub notes: Vec<String>,
}

impl SegmentCheck {
    /// A clean result.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A result with one finding.
    #[must_use]
    pub fn with_note(state: SegmentState, note: impl Into<String>) -> Self {
        Self {
            state,
            notes: vec![note.into()],
        }
    }
}

/// One segment of a dataset.
pub trait Segment: Send + Sync + Debug {
    /// Path relative to the dataset root.
    fn relpath(&self) -> &str;

    /// Absolute path of the segment data.
    fn abspath(&self) -> &Path;

    /// The format of the records stored here.
    fn format(&self) -> &Arc<dyn Format>;

    /// Returns true if the segment data exists on disk.
    fn exists(&self) -> bool;

    /// Bytes used on disk.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the segment does not exist.
    fn size(&self) -> CoreResult<u64>;

    /// Modification time of the segment data, in seconds since the epoch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the segment does not exist.
    fn mtime(&self) -> CoreResult<i64>;

    /// Appends one record's bytes.
    ///
    /// The caller must hold the segment append lock until the returned
    /// pending is resolved. On a write failure the segment is truncated
    /// back before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the bytes cannot be written.
    fn append(&self, data: &[u8]) -> CoreResult<Appended>;

    /// Reads the bytes of one record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the segment does not exist, or
    /// [`CoreError::Truncated`] if the range is past its end.
    fn read(&self, offset: u64, size: u64) -> CoreResult<Bytes>;

    /// Compares the segment with `records`, given in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read, or a record belongs
    /// to another segment.
    fn check(&self, records: &[Record], quick: bool) -> CoreResult<SegmentCheck>;

    /// Recovers the records stored in the segment, in on-disk order.
    ///
    /// Returned records carry their source but not their bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read. Spans the format
    /// cannot parse are skipped.
    fn scan(&self) -> CoreResult<Vec<Record>>;

    /// Rewrites the segment with `records` in the given order, without gaps.
    ///
    /// Sources in `records` are updated to the new layout right away; the
    /// new data replaces the old only when the pending commits.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read or, with `validate`,
    /// fails validation.
    fn repack(&self, records: &mut [Record], validate: bool) -> CoreResult<Pending>;

    /// Deletes the segment data, returning the bytes freed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the data cannot be removed.
    fn remove(&self) -> CoreResult<u64>;

    /// Drops everything from `offset` onwards, keeping the modification time.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment does not exist or is shorter.
    fn truncate(&self, offset: u64) -> CoreResult<()>;

    /// Inserts `size` bytes of garbage before record `index`, updating the
    /// sources of the records it shifts.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten.
    fn make_hole(&self, records: &mut [Record], index: usize, size: u64) -> CoreResult<()>;

    /// Moves record `index` onwards back by `overlap` bytes, updating the
    /// sources of the records it shifts.
    ///
    /// # Errors
    ///
    /// Returns an error for the first record or if the segment cannot be
    /// rewritten.
    fn make_overlap(&self, records: &mut [Record], index: usize, overlap: u64) -> CoreResult<()>;

    /// Damages the bytes of record `index` so that validation fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten.
    fn corrupt(&self, records: &[Record], index: usize) -> CoreResult<()>;
}

/// Identity shared by every segment kind.
#[derive(Debug, Clone)]
pub(crate) struct SegmentBase {
    pub(crate) root: PathBuf,
    pub(crate) relpath: String,
    pub(crate) abspath: PathBuf,
    pub(crate) format: Arc<dyn Format>,
}

impl SegmentBase {
    pub(crate) fn new(root: &Path, relpath: &str, format: Arc<dyn Format>) -> Self {
        Self {
            root: root.to_path_buf(),
            relpath: relpath.to_string(),
            abspath: root.join(relpath),
            format,
        }
    }

    pub(crate) fn source(&self, offset: u64, size: u64) -> Source {
        Source::new(
            self.format.name(),
            self.root.clone(),
            self.relpath.clone(),
            offset,
            size,
        )
    }

    /// Parses `data` found at `offset` into a record with a source.
    pub(crate) fn scanned(&self, data: &[u8], offset: u64) -> CoreResult<Record> {
        let mut record = self.format.parse(data)?;
        record.source = Some(self.source(offset, data.len() as u64));
        Ok(record)
    }

    pub(crate) fn not_found(&self) -> CoreError {
        CoreError::not_found(format!("segment {}", self.relpath))
    }

    pub(crate) fn truncated(&self, offset: u64, size: u64, file_size: u64) -> CoreError {
        CoreError::Truncated {
            path: self.abspath.clone(),
            offset,
            size,
            file_size,
        }
    }

    /// Maps storage read errors to the segment-level errors.
    pub(crate) fn read_error(&self, err: StorageError, offset: u64, size: u64) -> CoreError {
        match err {
            StorageError::NotFound(_) => self.not_found(),
            StorageError::ReadPastEnd { size: file_size, .. } => {
                self.truncated(offset, size, file_size)
            }
            other => other.into(),
        }
    }

    pub(crate) fn repack_path(&self) -> PathBuf {
        with_suffix(&self.abspath, ".repack")
    }
}

/// Appends `data` followed by `padding` to `backend` and flushes it,
/// returning the previous size and the offset of `data`.
///
/// On failure the backend is truncated back to its previous size before
/// the error is returned.
///
/// # Errors
///
/// Returns the storage error of the failed write.
pub fn append_padded(
    backend: &mut dyn StorageBackend,
    data: &[u8],
    padding: &[u8],
) -> CoreResult<(u64, u64)> {
    let start = backend.size()?;
    let written = backend.append(data).and_then(|offset| {
        if !padding.is_empty() {
            backend.append(padding)?;
        }
        backend.flush()?;
        Ok(offset)
    });
    match written {
        Ok(offset) => Ok((start, offset)),
        Err(e) => {
            if let Err(undo) = backend.truncate(start) {
                warn!(error = %undo, "cannot truncate after failed append");
            }
            Err(e.into())
        }
    }
}

/// Converts a record size to an in-memory length.
pub(crate) fn len_of(size: u64) -> CoreResult<usize> {
    usize::try_from(size)
        .map_err(|_| CoreError::invalid_operation(format!("{size} bytes do not fit in memory")))
}

/// Opens segments of one dataset.
#[derive(Debug, Clone)]
pub struct SegmentManager {
    dir: DatasetDir,
    kind: SegmentKind,
    format: Arc<dyn Format>,
}

impl SegmentManager {
    /// Creates a manager for segments of `format` under `dir`.
    #[must_use]
    pub fn new(dir: DatasetDir, kind: SegmentKind, format: Arc<dyn Format>) -> Self {
        Self { dir, kind, format }
    }

    /// Returns the dataset directory.
    #[must_use]
    pub fn dir(&self) -> &DatasetDir {
        &self.dir
    }

    /// Returns the record format.
    #[must_use]
    pub fn format(&self) -> &Arc<dyn Format> {
        &self.format
    }

    /// Opens a segment by relpath.
    ///
    /// An existing segment keeps the kind it has on disk; a new one gets
    /// the configured kind.
    #[must_use]
    pub fn get(&self, relpath: &str) -> Arc<dyn Segment> {
        let root = self.dir.root();
        let abspath = root.join(relpath);
        let format = Arc::clone(&self.format);
        if abspath.join(SEQUENCE_FILE).exists() {
            return Arc::new(DirSegment::new(root, relpath, format));
        }
        if with_suffix(&abspath, ".lz4").exists() {
            let group = match self.kind {
                SegmentKind::Compressed { group_size } => group_size,
                _ => 1,
            };
            return Arc::new(CompressedSegment::new(root, relpath, format, group));
        }
        if abspath.is_file() {
            return Arc::new(ConcatSegment::new(root, relpath, format));
        }
        match self.kind {
            SegmentKind::Concat => Arc::new(ConcatSegment::new(root, relpath, format)),
            SegmentKind::Dir => Arc::new(DirSegment::new(root, relpath, format)),
            SegmentKind::Compressed { group_size } => {
                Arc::new(CompressedSegment::new(root, relpath, format, group_size))
            }
        }
    }

    /// Lists the relpaths of the segments on disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the dataset cannot be walked.
    pub fn list(&self) -> CoreResult<Vec<String>> {
        self.dir.list_segments(self.format.name())
    }
}
