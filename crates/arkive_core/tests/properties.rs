//! Property tests over random append workloads.

use arkive_core::{AcquireResult, IndexKind, NullReporter, Query, SegmentKind, SegmentState};
use arkive_testkit::prelude::*;
use chrono::NaiveDate;
use proptest::prelude::*;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2007, 7, 8).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn appended_records_never_overlap(records in vm2_day_strategy(day(), 24)) {
        let ds = TestDataset::new();
        for record in &records {
            ds.append(record.clone());
        }

        let stored = ds.query_all();
        prop_assert_eq!(stored.len(), records.len());
        let mut spans: Vec<_> = stored
            .iter()
            .map(|r| {
                let s = r.source.as_ref().unwrap();
                (s.offset, s.end())
            })
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }

        let states = ds.checker().scan(&NullReporter, false).unwrap();
        prop_assert!(states.values().all(|s| s.is_ok()), "{:?}", states);
    }

    #[test]
    fn query_returns_records_in_time_order(records in vm2_day_strategy(day(), 24)) {
        let ds = TestDataset::with(SegmentKind::Dir, IndexKind::Sqlite);
        for record in &records {
            ds.append(record.clone());
        }
        let stored = ds.reader().query_all(&Query::all().with_data(true)).unwrap();
        prop_assert!(stored.windows(2).all(|w| w[0].reftime <= w[1].reftime));
        for record in &stored {
            prop_assert!(record.data.is_some());
        }
    }

    #[test]
    fn rolled_back_appends_change_nothing(records in vm2_day_strategy(day(), 8)) {
        let ds = TestDataset::new();
        let (kept, dropped) = records.split_at(records.len() / 2);
        for record in kept {
            ds.append(record.clone());
        }
        let size = std::fs::metadata(ds.path().join("2007/07-08.vm2")).map(|m| m.len()).ok();

        for record in dropped {
            ds.writer().prepare(record).unwrap().rollback().unwrap();
        }

        let after = std::fs::metadata(ds.path().join("2007/07-08.vm2")).map(|m| m.len()).ok();
        prop_assert_eq!(size, after);
        prop_assert_eq!(ds.query_all().len(), kept.len());
        if !kept.is_empty() {
            prop_assert_eq!(
                ds.checker().segment_state("2007/07-08.vm2", false).unwrap().state,
                SegmentState::OK
            );
        }
    }

    #[test]
    fn every_step_puts_records_in_their_segment(
        records in prop::collection::vec(vm2_record_strategy(reftime_strategy()), 1..12),
        step in step_strategy(),
    ) {
        let mut records = records;
        records.sort_by_key(|r| r.reftime);
        let ds = TestDataset::with_config(|c| c.step(step));
        let mut stored = 0;
        for record in &records {
            match ds.writer().acquire(&mut record.clone()) {
                AcquireResult::Ok => stored += 1,
                AcquireResult::Duplicate => {}
                AcquireResult::Error => prop_assert!(false, "append failed"),
            }
        }
        let found = ds.query_all();
        prop_assert_eq!(found.len(), stored);
        for record in found {
            let source = record.source.as_ref().unwrap();
            let reftime = record.reftime.unwrap();
            prop_assert_eq!(&source.relpath, &step.relpath(&reftime, "vm2"));
            prop_assert!(record.data.is_none());
        }
        prop_assert!(ds.checker().scan(&NullReporter, false).unwrap().values().all(|s| s.is_ok()));
    }
}
