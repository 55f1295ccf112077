//! Temporary datasets and record helpers.

use arkive_core::{
    parse_time, AcquireResult, Dataset, DatasetConfig, IndexKind, Query, Record, SegmentKind,
    Vm2Format,
};
use std::path::Path;
use tempfile::TempDir;

/// Builds a vm2 observation at `time` (`YYYY-MM-DD HH:MM:SS`).
pub fn vm2(time: &str, station: &str, value: &str) -> Record {
    Vm2Format::record(
        parse_time(time).expect("Invalid test time"),
        station,
        "227",
        value,
    )
}

/// A daily vm2 dataset in a temporary directory.
pub struct TestDataset {
    /// The dataset.
    pub dataset: Dataset,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestDataset {
    /// Creates a dataset with concatenated segments and per-segment indexes.
    pub fn new() -> Self {
        Self::with(SegmentKind::Concat, IndexKind::PerSegment)
    }

    /// Creates a dataset with the given segment and index kinds.
    pub fn with(segments: SegmentKind, index: IndexKind) -> Self {
        Self::with_config(|config| config.segments(segments).index(index))
    }

    /// Creates a dataset from a configuration adjusted by `configure`.
    pub fn with_config(configure: impl FnOnce(DatasetConfig) -> DatasetConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = configure(DatasetConfig::new(temp_dir.path(), "test", "vm2"));
        let dataset = Dataset::open(config).expect("Failed to open test dataset");
        Self {
            dataset,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the dataset root.
    pub fn path(&self) -> &Path {
        self.dataset.root()
    }

    /// Reopens the dataset with the same configuration.
    pub fn reopen(&self) -> Dataset {
        Dataset::open(self.dataset.config().clone()).expect("Failed to reopen test dataset")
    }

    /// Appends a record, panicking unless it is stored.
    pub fn append(&self, mut record: Record) -> Record {
        assert_eq!(self.dataset.writer().acquire(&mut record), AcquireResult::Ok);
        record
    }

    /// Appends `count` hourly observations on `day` (`YYYY-MM-DD`), from
    /// station 1 upwards.
    pub fn fill_day(&self, day: &str, count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                let time = format!("{day} {:02}:00:00", i % 24);
                self.append(vm2(&time, &(i / 24 + 1).to_string(), &i.to_string()))
            })
            .collect()
    }

    /// Returns every record in the dataset.
    pub fn query_all(&self) -> Vec<Record> {
        self.dataset
            .reader()
            .query_all(&Query::all())
            .expect("Query failed")
    }
}

impl Default for TestDataset {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDataset {
    type Target = Dataset;

    fn deref(&self) -> &Self::Target {
        &self.dataset
    }
}
