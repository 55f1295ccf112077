//! Benchmark utilities.

use arkive_core::{AcquireResult, Dataset, DatasetConfig, Record, Time, Vm2Format};
use chrono::{Duration, NaiveDate};
use tempfile::TempDir;

/// First reference time used by the generators.
pub fn base_time() -> Time {
    NaiveDate::from_ymd_opt(2007, 7, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Generate the `n`th observation: one per minute from [`base_time`],
/// cycling over ten stations.
pub fn observation(n: u64) -> Record {
    let minutes = i64::try_from(n / 10).unwrap_or(i64::MAX);
    let time = base_time() + Duration::minutes(minutes);
    Vm2Format::record(time, &(n % 10 + 1).to_string(), "227", &format!("{}.5", n % 100))
}

/// Open a dataset in a fresh temporary directory.
pub fn temp_dataset(configure: impl FnOnce(DatasetConfig) -> DatasetConfig) -> (TempDir, Dataset) {
    let dir = TempDir::new().unwrap();
    let config = configure(DatasetConfig::new(dir.path(), "bench", "vm2"));
    let dataset = Dataset::open(config).unwrap();
    (dir, dataset)
}

/// Append observations `from..to`.
pub fn fill(dataset: &Dataset, from: u64, to: u64) {
    let writer = dataset.writer();
    for n in from..to {
        let mut record = observation(n);
        assert_eq!(writer.acquire(&mut record), AcquireResult::Ok);
    }
}
