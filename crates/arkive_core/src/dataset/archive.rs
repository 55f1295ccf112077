//! The online archive under `.archive/last`.
//!
//! Archived segments keep their relpath and get a plain index of their own,
//! so that they stay readable after they leave the live dataset.

use super::DatasetInner;
use crate::config::IndexKind;
use crate::dir::DatasetDir;
use crate::error::CoreResult;
use crate::index::{DatasetIndex, SimpleIndex};
use crate::lock::LockScope;
use crate::record::Record;
use crate::segment::{Segment, SegmentManager};
use std::path::Path;
use std::sync::Arc;

/// Segments moved out of the live dataset.
#[derive(Debug)]
pub(crate) struct Archive {
    pub(crate) segments: SegmentManager,
    pub(crate) index: SimpleIndex,
}

impl Archive {
    /// Opens the archive of `inner`, or returns `None` if nothing was ever
    /// archived.
    pub(crate) fn open(inner: &DatasetInner) -> CoreResult<Option<Self>> {
        if inner.dir.archive_root().is_dir() {
            Self::create(inner).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Opens the archive of `inner`, creating its directory if needed.
    pub(crate) fn create(inner: &DatasetInner) -> CoreResult<Self> {
        let root = inner.dir.archive_root();
        let dir = DatasetDir::open(&root, true)?;
        let segments = SegmentManager::new(dir, inner.config.segments, Arc::clone(&inner.format));
        let index = SimpleIndex::open(&root, IndexKind::Plain, inner.config.step, inner.unique.clone())?;
        Ok(Self { segments, index })
    }

    pub(crate) fn root(&self) -> &Path {
        self.segments.dir().root()
    }

    pub(crate) fn segment_scope(&self, relpath: &str) -> LockScope {
        LockScope::segment(self.root(), relpath)
    }

    /// Indexes `records` for the segment already moved to `relpath`.
    pub(crate) fn index_segment(&self, relpath: &str, records: &[Record]) -> CoreResult<()> {
        let segment: Arc<dyn Segment> = self.segments.get(relpath);
        self.index.reindex(segment, records)?.commit()
    }
}
