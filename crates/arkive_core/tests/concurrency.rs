//! Concurrent writers, readers and checkers on one dataset.

use arkive_core::{AcquireResult, IndexKind, NullReporter, Query, SegmentKind, SegmentState};
use arkive_testkit::prelude::*;
use std::thread;

const SEGMENT: &str = "2007/07-08.vm2";

#[test]
fn three_writers_on_disjoint_days() {
    for index in [IndexKind::PerSegment, IndexKind::Plain, IndexKind::Sqlite] {
        let ds = TestDataset::with(SegmentKind::Concat, index);
        let handles: Vec<_> = (0..3)
            .map(|worker| {
                let writer = ds.writer();
                thread::spawn(move || {
                    for i in 0..20 {
                        let time = format!("2007-07-{:02} {:02}:{:02}:00", 8 + worker, i % 24, i);
                        let mut record = vm2(&time, "1", &i.to_string());
                        assert_eq!(writer.acquire(&mut record), AcquireResult::Ok);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = ds.query_all();
        assert_eq!(records.len(), 60, "{index:?}");
        for day in ["2007/07-08.vm2", "2007/07-09.vm2", "2007/07-10.vm2"] {
            let mut spans: Vec<_> = records
                .iter()
                .filter(|r| r.is_in(day))
                .map(|r| r.source.clone().unwrap())
                .collect();
            assert_eq!(spans.len(), 20);
            spans.sort_by_key(|s| s.offset);
            for pair in spans.windows(2) {
                assert!(pair[0].end() < pair[1].offset, "{index:?}: {pair:?}");
            }
        }
        let states = ds.checker().scan(&NullReporter, false).unwrap();
        assert!(states.values().all(|s| s.is_ok()), "{index:?}: {states:?}");
    }
}

#[test]
fn three_writers_on_one_segment() {
    let ds = TestDataset::new();
    let handles: Vec<_> = (0..3)
        .map(|worker| {
            let writer = ds.writer();
            thread::spawn(move || {
                for i in 0..20 {
                    let time = format!("2007-07-08 {:02}:{:02}:00", i % 24, worker);
                    let mut record = vm2(&time, &(worker + 1).to_string(), &i.to_string());
                    assert_eq!(writer.acquire(&mut record), AcquireResult::Ok);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ds.query_all().len(), 60);
    // Offsets are reserved in arrival order, not in reference time order.
    let state = ds.checker().segment_state(SEGMENT, false).unwrap().state;
    assert!(state == SegmentState::OK || state == SegmentState::DIRTY, "{state}");
}

#[test]
fn appends_to_different_segments_run_in_parallel() {
    let ds = TestDataset::new();
    let handles: Vec<_> = (1..=4)
        .map(|day| {
            let writer = ds.writer();
            thread::spawn(move || {
                for hour in 0..10 {
                    let time = format!("2007-07-{day:02} {hour:02}:00:00");
                    let mut record = vm2(&time, "1", "0");
                    assert_eq!(writer.acquire(&mut record), AcquireResult::Ok);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let states = ds.checker().scan(&NullReporter, false).unwrap();
    assert_eq!(states.len(), 4);
    assert!(states.values().all(|s| s.is_ok()));
    assert_eq!(ds.query_all().len(), 40);
}

#[test]
fn query_sees_a_fixed_snapshot() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 2);

    let mut stream = ds.reader().query(&Query::all().with_data(true)).unwrap();
    let first = stream.next().unwrap().unwrap();
    ds.append(vm2("2007-07-08 23:00:00", "9", "late"));
    ds.append(vm2("2007-07-09 00:00:00", "1", "next day"));

    let rest: Vec<_> = stream.map(Result::unwrap).collect();
    assert_eq!(rest.len(), 1);
    assert_eq!(first.attr("value"), Some("0"));
    assert_eq!(rest[0].bytes().unwrap().as_ref(), b"20070708010000,1,227,1");

    assert_eq!(ds.query_all().len(), 4);
}

#[test]
fn writer_and_checker_threads_interleave() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 4);
    Scenario::HoleInMiddle.apply(&ds, SEGMENT).unwrap();

    let writer = ds.writer();
    let appender = thread::spawn(move || {
        for hour in 0..12 {
            let time = format!("2007-07-09 {hour:02}:00:00");
            let mut record = vm2(&time, "1", "0");
            assert_eq!(writer.acquire(&mut record), AcquireResult::Ok);
        }
    });
    let checker = ds.checker();
    let repacker = thread::spawn(move || checker.repack(&NullReporter, true).map(|r| r.bytes_freed));

    appender.join().unwrap();
    let freed = repacker.join().unwrap().unwrap();
    assert_eq!(freed, HOLE_SIZE);

    assert_eq!(ds.query_all().len(), 16);
    let states = ds.checker().scan(&NullReporter, false).unwrap();
    assert!(states.values().all(|s| s.is_ok()), "{states:?}");
}
