//! Dataset configuration.

use crate::error::{CoreError, CoreResult};
use crate::step::Step;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// On-disk layout of newly created segments.
///
/// Existing segments keep the layout they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentKind {
    /// One growable file of back-to-back records.
    Concat,
    /// A directory with one file per record.
    Dir,
    /// An lz4-compressed concatenation with an optional block index.
    Compressed {
        /// Records per compression block when repacking.
        group_size: usize,
    },
}

impl Default for SegmentKind {
    fn default() -> Self {
        Self::Concat
    }
}

/// Where a dataset keeps its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Flat `MANIFEST` file plus per-segment `.metadata` sidecars.
    Plain,
    /// `index.sqlite` manifest plus per-segment `.metadata` sidecars.
    Sqlite,
    /// One `.index` sqlite database next to each segment.
    #[default]
    PerSegment,
}

/// What to do when an appended record has the unique key of an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Reject the new record as a duplicate.
    #[default]
    Never,
    /// Supersede the old record, leaving its bytes as a hole.
    Always,
}

/// How a DIRTY segment is classified when the index is untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UntrustedDirtyPolicy {
    /// Report DIRTY as UNALIGNED so the segment is rescanned, never repacked.
    #[default]
    Downgrade,
    /// Keep DIRTY and let repack trust the current offsets.
    Keep,
}

/// Lock acquisition behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Wait until the lock is available.
    #[default]
    Blocking,
    /// Fail with [`CoreError::LockConflict`] if the lock is held.
    NonBlocking,
}

/// Configuration for opening a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Dataset root directory.
    pub root: PathBuf,
    /// Dataset name, used in reports.
    pub name: String,
    /// Format registry key of the records stored.
    pub format: String,
    /// Time partitioning step.
    pub step: Step,
    /// Layout of new segments.
    pub segments: SegmentKind,
    /// Index backend.
    pub index: IndexKind,
    /// Days after which segments are archived.
    pub archive_age: Option<u32>,
    /// Days after which segments are deleted.
    pub delete_age: Option<u32>,
    /// Duplicate handling on append.
    pub replace: ReplaceStrategy,
    /// Attributes that together with the reference time identify a record.
    ///
    /// Empty means the format's default unique attributes.
    pub unique: Vec<String>,
    /// Treat the index as untrusted even without a needs-rebuild flag.
    pub untrusted_index: bool,
    /// Classification of DIRTY segments under an untrusted index.
    pub untrusted_dirty: UntrustedDirtyPolicy,
    /// Lock acquisition behavior.
    pub locking: LockMode,
    /// Whether to create the root directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            name: String::new(),
            format: String::new(),
            step: Step::Daily,
            segments: SegmentKind::Concat,
            index: IndexKind::PerSegment,
            archive_age: None,
            delete_age: None,
            replace: ReplaceStrategy::Never,
            unique: Vec::new(),
            untrusted_index: false,
            untrusted_dirty: UntrustedDirtyPolicy::Downgrade,
            locking: LockMode::Blocking,
            create_if_missing: true,
        }
    }
}

impl DatasetConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            format: format.into(),
            ..Self::default()
        }
    }

    /// Sets the partitioning step.
    #[must_use]
    pub const fn step(mut self, step: Step) -> Self {
        self.step = step;
        self
    }

    /// Sets the layout of new segments.
    #[must_use]
    pub const fn segments(mut self, kind: SegmentKind) -> Self {
        self.segments = kind;
        self
    }

    /// Sets the index backend.
    #[must_use]
    pub const fn index(mut self, kind: IndexKind) -> Self {
        self.index = kind;
        self
    }

    /// Sets the archive age in days.
    #[must_use]
    pub const fn archive_age(mut self, days: u32) -> Self {
        self.archive_age = Some(days);
        self
    }

    /// Sets the delete age in days.
    #[must_use]
    pub const fn delete_age(mut self, days: u32) -> Self {
        self.delete_age = Some(days);
        self
    }

    /// Sets the duplicate handling strategy.
    #[must_use]
    pub const fn replace(mut self, strategy: ReplaceStrategy) -> Self {
        self.replace = strategy;
        self
    }

    /// Sets the unique attributes.
    #[must_use]
    pub fn unique<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the index as untrusted.
    #[must_use]
    pub const fn untrusted_index(mut self, value: bool) -> Self {
        self.untrusted_index = value;
        self
    }

    /// Sets the DIRTY classification policy under an untrusted index.
    #[must_use]
    pub const fn untrusted_dirty(mut self, policy: UntrustedDirtyPolicy) -> Self {
        self.untrusted_dirty = policy;
        self
    }

    /// Sets the lock acquisition behavior.
    #[must_use]
    pub const fn locking(mut self, mode: LockMode) -> Self {
        self.locking = mode;
        self
    }

    /// Sets whether to create the root directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Checks the configuration for inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> CoreResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(CoreError::invalid_config("dataset root is not set"));
        }
        if self.name.is_empty() {
            return Err(CoreError::invalid_config("dataset name is not set"));
        }
        if self.format.is_empty() || self.format.contains(['.', '/']) {
            return Err(CoreError::invalid_config(format!(
                "invalid format name {:?}",
                self.format
            )));
        }
        if let SegmentKind::Compressed { group_size: 0 } = self.segments {
            return Err(CoreError::invalid_config("compression group size must be positive"));
        }
        if let (Some(archive), Some(delete)) = (self.archive_age, self.delete_age) {
            if archive >= delete {
                return Err(CoreError::invalid_config(format!(
                    "archive age ({archive} days) must be less than delete age ({delete} days)"
                )));
            }
        }
        Ok(())
    }
}
