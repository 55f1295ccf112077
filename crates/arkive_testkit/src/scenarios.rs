//! Canned segment faults for exercising the checker.
//!
//! Scenarios expect a concatenated vm2 segment holding at least two
//! records, such as one written by [`TestDataset::fill_day`].
//!
//! [`TestDataset::fill_day`]: crate::fixtures::TestDataset::fill_day

use arkive_core::{CoreError, CoreResult, Dataset, Query, SegmentState};
use std::fmt;

/// Bytes of garbage inserted by the hole scenarios.
pub const HOLE_SIZE: u64 = 7;

/// A fault applied to one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Garbage before the first record.
    HoleAtStart,
    /// Garbage between the first and second record.
    HoleInMiddle,
    /// Garbage after the last record.
    HoleAtEnd,
    /// The second record moved back over the tail of the first.
    Overlap,
    /// The first record fails validation.
    CorruptFirst,
    /// The file is cut inside its last record.
    Truncated,
    /// The index forgot the segment.
    IndexRemoved,
}

impl Scenario {
    /// Every scenario.
    pub const ALL: [Scenario; 7] = [
        Scenario::HoleAtStart,
        Scenario::HoleInMiddle,
        Scenario::HoleAtEnd,
        Scenario::Overlap,
        Scenario::CorruptFirst,
        Scenario::Truncated,
        Scenario::IndexRemoved,
    ];

    /// Applies the fault to `relpath` in `dataset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten.
    pub fn apply(self, dataset: &Dataset, relpath: &str) -> CoreResult<()> {
        let checker = dataset.checker();
        match self {
            Scenario::HoleAtStart => checker.make_hole(relpath, 0, HOLE_SIZE),
            Scenario::HoleInMiddle => checker.make_hole(relpath, 1, HOLE_SIZE),
            Scenario::HoleAtEnd => {
                let count = indexed_count(dataset, relpath)?;
                checker.make_hole(relpath, count, HOLE_SIZE)
            }
            Scenario::Overlap => checker.make_overlap(relpath, 1, 5),
            Scenario::CorruptFirst => checker.corrupt(relpath, 0),
            Scenario::Truncated => {
                let size = std::fs::metadata(dataset.root().join(relpath))?.len();
                if size < 3 {
                    return Err(CoreError::invalid_operation(format!(
                        "{relpath} is too short to truncate"
                    )));
                }
                checker.truncate(relpath, size - 3)
            }
            Scenario::IndexRemoved => checker.remove_index(relpath),
        }
    }

    /// State a full check reports right after [`Scenario::apply`].
    #[must_use]
    pub const fn expected_state(self) -> SegmentState {
        match self {
            Scenario::HoleAtStart | Scenario::HoleInMiddle | Scenario::HoleAtEnd => {
                SegmentState::DIRTY
            }
            Scenario::Overlap
            | Scenario::CorruptFirst
            | Scenario::Truncated
            | Scenario::IndexRemoved => SegmentState::UNALIGNED,
        }
    }

    /// Returns true if repairing the fault keeps every record.
    #[must_use]
    pub const fn is_lossless(self) -> bool {
        matches!(
            self,
            Scenario::HoleAtStart
                | Scenario::HoleInMiddle
                | Scenario::HoleAtEnd
                | Scenario::IndexRemoved
        )
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scenario::HoleAtStart => "hole at start",
            Scenario::HoleInMiddle => "hole in middle",
            Scenario::HoleAtEnd => "hole at end",
            Scenario::Overlap => "overlap",
            Scenario::CorruptFirst => "corrupted first record",
            Scenario::Truncated => "truncated",
            Scenario::IndexRemoved => "index removed",
        };
        f.write_str(name)
    }
}

fn indexed_count(dataset: &Dataset, relpath: &str) -> CoreResult<usize> {
    let records = dataset.reader().query_all(&Query::all())?;
    Ok(records.iter().filter(|r| r.is_in(relpath)).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestDataset;
    use arkive_core::NullReporter;

    const SEGMENT: &str = "2007/07-08.vm2";

    #[test]
    fn every_scenario_is_detected() {
        for scenario in Scenario::ALL {
            let ds = TestDataset::new();
            ds.fill_day("2007-07-08", 3);
            scenario.apply(&ds, SEGMENT).unwrap();
            let state = ds.checker().segment_state(SEGMENT, false).unwrap().state;
            assert_eq!(state, scenario.expected_state(), "{scenario}");
        }
    }

    #[test]
    fn repair_restores_ok() {
        for scenario in Scenario::ALL {
            let ds = TestDataset::new();
            ds.fill_day("2007-07-08", 3);
            scenario.apply(&ds, SEGMENT).unwrap();

            let checker = ds.checker();
            checker.check(&NullReporter, true, false).unwrap();
            checker.repack(&NullReporter, true).unwrap();

            assert_eq!(
                checker.segment_state(SEGMENT, false).unwrap().state,
                SegmentState::OK,
                "{scenario}"
            );
            if scenario.is_lossless() {
                assert_eq!(ds.query_all().len(), 3, "{scenario}");
            }
        }
    }
}
