//! Opening a dataset and handing out its readers, writers and checkers.

mod archive;
mod reader;
mod writer;

pub(crate) use archive::Archive;

pub use reader::{Query, QueryStream, Reader};
pub use writer::{AcquireResult, PreparedAppend, Writer};

use crate::config::{DatasetConfig, IndexKind};
use crate::dir::{DatasetDir, Flag};
use crate::error::CoreResult;
use crate::format::{Format, FormatRegistry};
use crate::index::{manifest, DatasetIndex, SegmentedIndex, SimpleIndex};
use crate::lock::{LockCoordinator, LockScope};
use crate::maintenance::Checker;
use crate::segment::SegmentManager;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// State shared by every handle on one open dataset.
#[derive(Debug)]
pub(crate) struct DatasetInner {
    pub(crate) config: DatasetConfig,
    pub(crate) dir: DatasetDir,
    pub(crate) format: Arc<dyn Format>,
    pub(crate) segments: SegmentManager,
    pub(crate) index: Box<dyn DatasetIndex>,
    pub(crate) locks: LockCoordinator,
    /// Attributes forming the unique key, after format defaults.
    pub(crate) unique: Vec<String>,
}

impl DatasetInner {
    pub(crate) fn dataset_scope(&self) -> LockScope {
        LockScope::dataset(self.dir.root())
    }

    pub(crate) fn segment_scope(&self, relpath: &str) -> LockScope {
        LockScope::segment(self.dir.root(), relpath)
    }
}

/// An open dataset.
///
/// Cloning is cheap; clones share the index connection.
#[derive(Debug, Clone)]
pub struct Dataset {
    inner: Arc<DatasetInner>,
}

impl Dataset {
    /// Opens a dataset with the built-in formats.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`](crate::CoreError::InvalidConfig)
    /// for a bad configuration, [`CoreError::NotFound`](crate::CoreError::NotFound)
    /// if the root is missing and may not be created, or an error opening
    /// the index.
    pub fn open(config: DatasetConfig) -> CoreResult<Self> {
        Self::open_with_registry(config, &FormatRegistry::default())
    }

    /// Opens a dataset, looking its format up in `registry`.
    ///
    /// A plain or sqlite dataset that has segments but no manifest gets the
    /// needs-rebuild flag, so that its index is rebuilt by the next check.
    ///
    /// # Errors
    ///
    /// See [`Dataset::open`].
    pub fn open_with_registry(config: DatasetConfig, registry: &FormatRegistry) -> CoreResult<Self> {
        config.validate()?;
        let format = registry.get(&config.format)?;
        let dir = DatasetDir::open(&config.root, config.create_if_missing)?;
        let root = dir.root().to_path_buf();
        let unique = if config.unique.is_empty() {
            format.default_unique()
        } else {
            config.unique.clone()
        };
        let segments = SegmentManager::new(dir.clone(), config.segments, Arc::clone(&format));

        let index: Box<dyn DatasetIndex> = match config.index {
            IndexKind::PerSegment => Box::new(SegmentedIndex::new(
                &root,
                format.name(),
                config.step,
                unique.clone(),
            )),
            kind => {
                let had_manifest = manifest::exists(&root, kind);
                let index = SimpleIndex::open(&root, kind, config.step, unique.clone())?;
                if !had_manifest && !segments.list()?.is_empty() {
                    warn!(dataset = %config.name, "segments found without a manifest, index needs rebuilding");
                    dir.set_flag(Flag::NeedsRebuild)?;
                }
                Box::new(index)
            }
        };

        info!(
            dataset = %config.name,
            root = %root.display(),
            format = format.name(),
            index = ?config.index,
            "dataset opened"
        );
        Ok(Self {
            inner: Arc::new(DatasetInner {
                locks: LockCoordinator::new(config.locking),
                config,
                dir,
                format,
                segments,
                index,
                unique,
            }),
        })
    }

    /// Returns the configuration the dataset was opened with.
    #[must_use]
    pub fn config(&self) -> &DatasetConfig {
        &self.inner.config
    }

    /// Returns the dataset root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.inner.dir.root()
    }

    /// Returns a query handle.
    #[must_use]
    pub fn reader(&self) -> Reader {
        Reader::new(Arc::clone(&self.inner))
    }

    /// Returns an append handle.
    #[must_use]
    pub fn writer(&self) -> Writer {
        Writer::new(Arc::clone(&self.inner))
    }

    /// Returns a maintenance handle using the system clock.
    #[must_use]
    pub fn checker(&self) -> Checker {
        Checker::new(Arc::clone(&self.inner))
    }
}
