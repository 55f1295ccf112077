//! Integration tests for the maintenance engine.

use arkive_core::{
    parse_time, Action, CoreError, DatasetDir, FixedClock, Flag, IndexKind, LockMode,
    NullReporter, Query, ReportLog, SegmentKind, SegmentState, TimeSpan,
};
use arkive_testkit::prelude::*;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const SEGMENT: &str = "2007/07-08.vm2";

fn clock_at(time: &str) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(parse_time(time).unwrap()))
}

fn state(ds: &TestDataset, relpath: &str) -> SegmentState {
    ds.checker().segment_state(relpath, false).unwrap().state
}

#[test]
fn fresh_dataset_is_clean() {
    for (segments, index) in [
        (SegmentKind::Concat, IndexKind::PerSegment),
        (SegmentKind::Concat, IndexKind::Plain),
        (SegmentKind::Dir, IndexKind::Sqlite),
        (SegmentKind::Compressed { group_size: 2 }, IndexKind::PerSegment),
    ] {
        let ds = TestDataset::with(segments, index);
        ds.fill_day("2007-07-08", 3);
        ds.fill_day("2007-07-09", 2);

        let log = ReportLog::new();
        let states = ds.checker().scan(&log, false).unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.values().all(|s| s.is_ok()), "{segments:?}/{index:?}: {states:?}");
        assert!(ds.checker().repack(&NullReporter, true).unwrap().is_noop());
    }
}

#[test]
fn hole_is_reclaimed_by_repack() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 3);
    let size = std::fs::metadata(ds.path().join(SEGMENT)).unwrap().len();

    Scenario::HoleAtStart.apply(&ds, SEGMENT).unwrap();
    assert_eq!(state(&ds, SEGMENT), SegmentState::DIRTY);

    let dry = ds.checker().repack(&NullReporter, false).unwrap();
    assert_eq!(dry.count(Action::Repacked), 1);
    assert_eq!(dry.bytes_freed, 0);
    assert_eq!(state(&ds, SEGMENT), SegmentState::DIRTY);

    let report = ds.checker().repack(&NullReporter, true).unwrap();
    assert_eq!(report.count(Action::Repacked), 1);
    assert_eq!(report.bytes_freed, HOLE_SIZE);
    assert_eq!(state(&ds, SEGMENT), SegmentState::OK);
    assert_eq!(std::fs::metadata(ds.path().join(SEGMENT)).unwrap().len(), size);
    assert_eq!(ds.query_all().len(), 3);
}

#[test]
fn repack_of_clean_dataset_is_a_noop() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 4);
    Scenario::HoleInMiddle.apply(&ds, SEGMENT).unwrap();

    assert!(!ds.checker().repack(&NullReporter, true).unwrap().is_noop());
    let again = ds.checker().repack(&NullReporter, true).unwrap();
    assert!(again.is_noop(), "{again}");
    assert_eq!(again.segments, 1);
}

#[test]
fn removed_record_leaves_a_hole() {
    let ds = TestDataset::new();
    let records = ds.fill_day("2007-07-08", 3);

    ds.writer().remove(&records[1]).unwrap();
    assert_eq!(state(&ds, SEGMENT), SegmentState::DIRTY);
    assert_eq!(ds.query_all().len(), 2);

    let report = ds.checker().repack(&NullReporter, true).unwrap();
    assert_eq!(report.bytes_freed, 23);
    assert_eq!(state(&ds, SEGMENT), SegmentState::OK);

    let remaining = ds.query_all();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].attr("value"), Some("0"));
    assert_eq!(remaining[1].attr("value"), Some("2"));
}

#[test]
fn segment_without_live_data_is_deleted() {
    let ds = TestDataset::new();
    let records = ds.fill_day("2007-07-08", 2);
    for record in &records {
        ds.writer().remove(record).unwrap();
    }
    assert_eq!(state(&ds, SEGMENT), SegmentState::DELETED);

    let report = ds.checker().repack(&NullReporter, true).unwrap();
    assert_eq!(report.count(Action::Deleted), 1);
    assert_eq!(report.bytes_freed, 46);
    assert!(!ds.path().join(SEGMENT).exists());
    assert!(ds.checker().segments().unwrap().is_empty());
}

#[test]
fn lost_index_is_rebuilt_by_check() {
    for index in [IndexKind::PerSegment, IndexKind::Plain, IndexKind::Sqlite] {
        let ds = TestDataset::with(SegmentKind::Concat, index);
        let stored = ds.fill_day("2007-07-08", 3);
        Scenario::IndexRemoved.apply(&ds, SEGMENT).unwrap();
        assert_eq!(state(&ds, SEGMENT), SegmentState::UNALIGNED, "{index:?}");
        assert!(ds.query_all().is_empty());

        let dry = ds.checker().check(&NullReporter, false, false).unwrap();
        assert_eq!(dry.count(Action::Rescanned), 1);
        assert_eq!(state(&ds, SEGMENT), SegmentState::UNALIGNED);

        let log = ReportLog::new();
        let report = ds.checker().check(&log, true, false).unwrap();
        assert_eq!(report.count(Action::Rescanned), 1);
        assert_eq!(log.actions(), vec![(SEGMENT.to_string(), Action::Rescanned, false)]);
        assert_eq!(state(&ds, SEGMENT), SegmentState::OK, "{index:?}");

        let recovered = ds.query_all();
        assert_eq!(recovered.len(), 3);
        for (a, b) in stored.iter().zip(&recovered) {
            assert_eq!(a.source, b.source);
            assert_eq!(a.attrs, b.attrs);
        }
    }
}

#[test]
fn missing_data_is_deindexed() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 2);
    ds.fill_day("2007-07-09", 1);
    std::fs::remove_file(ds.path().join(SEGMENT)).unwrap();
    assert_eq!(state(&ds, SEGMENT), SegmentState::MISSING);

    let report = ds.checker().check(&NullReporter, true, false).unwrap();
    assert_eq!(report.count(Action::Deindexed), 1);
    assert_eq!(ds.checker().segments().unwrap(), vec!["2007/07-09.vm2".to_string()]);
    assert_eq!(ds.query_all().len(), 1);
}

#[test]
fn rescan_keeps_the_last_duplicate() {
    let ds = TestDataset::new();
    let first = ds.append(vm2("2007-07-08 13:00:00", "1", "1.0"));
    Scenario::IndexRemoved.apply(&ds, SEGMENT).unwrap();
    // The index no longer knows the first copy, so a second one is accepted.
    let second = ds.append(vm2("2007-07-08 13:00:00", "1", "2.0"));
    assert!(second.source.as_ref().unwrap().offset > first.source.as_ref().unwrap().offset);
    Scenario::IndexRemoved.apply(&ds, SEGMENT).unwrap();

    ds.checker().check(&NullReporter, true, false).unwrap();
    let records = ds.query_all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attr("value"), Some("2.0"));
    assert_eq!(state(&ds, SEGMENT), SegmentState::DIRTY);
}

#[test]
fn old_segments_are_archived() {
    let ds = TestDataset::with_config(|c| c.archive_age(5));
    ds.fill_day("2007-07-08", 2);
    ds.fill_day("2007-07-18", 1);
    let checker = ds.checker().with_clock(clock_at("2007-07-20 00:00:00"));

    let log = ReportLog::new();
    checker.scan(&log, true).unwrap();
    assert_eq!(log.states()[SEGMENT], SegmentState::ARCHIVE_AGE);
    assert_eq!(log.states()["2007/07-18.vm2"], SegmentState::OK);

    let report = checker.repack(&NullReporter, true).unwrap();
    assert_eq!(report.count(Action::Archived), 1);
    assert!(!ds.path().join(SEGMENT).exists());
    assert!(ds.path().join(".archive/last").join(SEGMENT).exists());
    assert!(ds.path().join(".archive/last").join(format!("{SEGMENT}.index")).exists());
    assert_eq!(checker.segments().unwrap(), vec!["2007/07-18.vm2"]);

    let span = TimeSpan::new(
        parse_time("2007-07-08 00:00:00").unwrap(),
        parse_time("2007-07-08 23:59:59").unwrap(),
    );
    let archived = ds
        .reader()
        .query_all(&Query::span(span).with_data(true))
        .unwrap();
    assert_eq!(archived.len(), 2);
    assert!(archived[0].data.as_ref().unwrap().starts_with(b"20070708000000"));
    assert_eq!(ds.query_all().len(), 3);
    assert_eq!(ds.reader().summary().unwrap().count, 3);
}

#[test]
fn delete_age_wins_over_archive_age() {
    let ds = TestDataset::with_config(|c| c.archive_age(5).delete_age(10));
    ds.fill_day("2007-07-08", 2);
    let checker = ds.checker().with_clock(clock_at("2007-07-20 00:00:00"));
    assert_eq!(
        checker.segment_state(SEGMENT, true).unwrap().state,
        SegmentState::DELETE_AGE
    );

    let report = checker.repack(&NullReporter, true).unwrap();
    assert_eq!(report.count(Action::Deleted), 1);
    assert_eq!(report.count(Action::Archived), 0);
    assert_eq!(report.bytes_freed, 46);
    assert!(!ds.path().join(".archive/last").join(SEGMENT).exists());
    assert!(ds.query_all().is_empty());
}

#[test]
fn dirty_old_segment_is_repacked_then_archived() {
    let ds = TestDataset::with_config(|c| c.archive_age(5));
    ds.fill_day("2007-07-08", 2);
    Scenario::HoleAtEnd.apply(&ds, SEGMENT).unwrap();
    let checker = ds.checker().with_clock(clock_at("2007-07-20 00:00:00"));

    let report = checker.repack(&NullReporter, true).unwrap();
    assert_eq!(report.count(Action::Repacked), 1);
    assert_eq!(report.count(Action::Archived), 1);
    let archived = ds.path().join(".archive/last").join(SEGMENT);
    assert_eq!(std::fs::metadata(archived).unwrap().len(), 46);
}

#[test]
fn do_not_pack_blocks_repack_until_checked() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 2);
    DatasetDir::open(ds.path(), false)
        .unwrap()
        .set_flag(Flag::DoNotPack)
        .unwrap();

    let err = ds.checker().repack(&NullReporter, true).unwrap_err();
    assert!(matches!(err, CoreError::NeedsCheck { .. }), "{err}");
    assert!(ds.checker().repack(&NullReporter, false).is_ok());

    ds.checker().check(&NullReporter, true, false).unwrap();
    assert!(ds.checker().repack(&NullReporter, true).is_ok());
}

#[test]
fn unresolved_check_keeps_do_not_pack() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 2);
    let dir = DatasetDir::open(ds.path(), false).unwrap();
    dir.set_flag(Flag::DoNotPack).unwrap();
    // A segment whose name does not fit the daily step cannot be rescanned.
    std::fs::write(ds.path().join("2007/stray.vm2"), b"20070708130000,1,227,1\n").unwrap();

    let report = ds.checker().check(&NullReporter, true, false).unwrap();
    assert_eq!(report.count(Action::ManualIntervention), 1);
    assert!(dir.has_flag(Flag::DoNotPack));
}

#[test]
fn cancelled_run_stops_early() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 1);
    ds.fill_day("2007-07-09", 1);
    let checker = ds.checker().with_cancel(Arc::new(AtomicBool::new(true)));

    let report = checker.check(&NullReporter, true, false).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.segments, 0);
}

#[test]
fn open_stream_blocks_repack_in_non_blocking_mode() {
    let ds = TestDataset::with_config(|c| c.locking(LockMode::NonBlocking));
    ds.fill_day("2007-07-08", 2);
    Scenario::HoleAtStart.apply(&ds, SEGMENT).unwrap();

    let mut stream = ds.reader().query(&Query::all()).unwrap();
    stream.next().unwrap().unwrap();
    assert_eq!(stream.remaining(), 1);
    let err = ds.checker().repack(&NullReporter, true).unwrap_err();
    assert!(err.is_lock_conflict(), "{err}");
    drop(stream);

    let dir = DatasetDir::open(ds.path(), false).unwrap();
    assert!(!dir.has_flag(Flag::DoNotPack));
    assert_eq!(ds.checker().repack(&NullReporter, true).unwrap().count(Action::Repacked), 1);
}

#[test]
fn stream_releases_each_segment_after_its_last_record() {
    let ds = TestDataset::with_config(|c| c.locking(LockMode::NonBlocking));
    ds.fill_day("2007-07-08", 2);
    ds.fill_day("2007-07-09", 1);

    let mut stream = ds.reader().query(&Query::all()).unwrap();
    stream.next().unwrap().unwrap();
    let err = ds.checker().remove_index(SEGMENT).unwrap_err();
    assert!(err.is_lock_conflict(), "{err}");

    stream.next().unwrap().unwrap();
    ds.checker().remove_index(SEGMENT).unwrap();
    let last = stream.next().unwrap().unwrap();
    assert!(last.is_in("2007/07-09.vm2"));
    assert!(stream.next().is_none());
}

#[test]
fn stream_sees_segments_repacked_before_it_reaches_them() {
    let ds = TestDataset::with_config(|c| c.locking(LockMode::NonBlocking));
    ds.fill_day("2007-07-08", 2);
    Scenario::HoleAtStart.apply(&ds, SEGMENT).unwrap();

    let stream = ds.reader().query(&Query::all().with_data(true)).unwrap();
    let report = ds.checker().repack(&NullReporter, true).unwrap();
    assert_eq!(report.count(Action::Repacked), 1);

    let records: Vec<_> = stream.map(Result::unwrap).collect();
    assert_eq!(records.len(), 2);
    for record in &records {
        let data = record.data.as_ref().unwrap();
        assert!(data.starts_with(b"20070708"), "{data:?}");
    }
}

#[test]
fn leftover_repack_directory_is_not_a_segment() {
    let ds = TestDataset::with(SegmentKind::Dir, IndexKind::Sqlite);
    ds.fill_day("2007-07-08", 2);
    let leftover = ds.path().join("2007/07-08.vm2.repack");
    std::fs::create_dir_all(&leftover).unwrap();
    std::fs::write(leftover.join("000000.vm2"), b"20070708000000,1,227,9\n").unwrap();
    std::fs::write(leftover.join(".sequence"), b"").unwrap();

    let report = ds.checker().check(&NullReporter, true, false).unwrap();
    assert_eq!(report.segments, 1);
    assert_eq!(report.count(Action::Rescanned), 0);
    assert_eq!(ds.query_all().len(), 2);
    assert_eq!(ds.checker().scan(&NullReporter, false).unwrap().len(), 1);
}

#[test]
fn compressed_segments_stay_queryable() {
    for (segments, index) in [
        (SegmentKind::Concat, IndexKind::PerSegment),
        (SegmentKind::Concat, IndexKind::Plain),
        (SegmentKind::Dir, IndexKind::Sqlite),
    ] {
        let ds = TestDataset::with(segments, index);
        ds.fill_day("2007-07-08", 3);
        let before: Vec<_> = ds
            .reader()
            .query_all(&Query::all().with_data(true))
            .unwrap()
            .into_iter()
            .map(|r| r.data)
            .collect();

        let log = ReportLog::new();
        let report = ds.checker().compress(&log, 2).unwrap();
        assert_eq!(report.count(Action::Compressed), 1, "{segments:?}/{index:?}");
        assert!(ds.path().join("2007/07-08.vm2.lz4").is_file());
        assert!(ds.path().join("2007/07-08.vm2.lz4.idx").is_file());
        assert!(!ds.path().join(SEGMENT).exists());

        let after: Vec<_> = ds
            .reader()
            .query_all(&Query::all().with_data(true))
            .unwrap()
            .into_iter()
            .map(|r| r.data)
            .collect();
        assert_eq!(after, before, "{segments:?}/{index:?}");
        assert_eq!(state(&ds, SEGMENT), SegmentState::OK, "{segments:?}/{index:?}");
        assert!(ds.checker().compress(&log, 2).unwrap().is_noop());

        ds.append(vm2("2007-07-08 10:00:00", "1", "42"));
        assert_eq!(ds.query_all().len(), 4);
    }
}

#[test]
fn dirty_segments_are_not_compressed() {
    let ds = TestDataset::new();
    ds.fill_day("2007-07-08", 3);
    Scenario::HoleAtStart.apply(&ds, SEGMENT).unwrap();

    let report = ds.checker().compress(&NullReporter, 2).unwrap();
    assert_eq!(report.count(Action::Compressed), 0);
    assert!(!ds.path().join("2007/07-08.vm2.lz4").exists());
    assert_eq!(ds.query_all().len(), 3);
}

#[test]
fn vacuum_keeps_data_queryable() {
    for index in [IndexKind::PerSegment, IndexKind::Plain, IndexKind::Sqlite] {
        let ds = TestDataset::with(SegmentKind::Concat, index);
        ds.fill_day("2007-07-08", 3);
        ds.checker().vacuum().unwrap();
        assert_eq!(ds.query_all().len(), 3, "{index:?}");
    }
}

#[test]
fn huge_age_thresholds_never_trigger() {
    let ds = TestDataset::with_config(|c| c.archive_age(u32::MAX - 1).delete_age(u32::MAX));
    ds.fill_day("2007-07-08", 2);
    let checker = ds.checker().with_clock(clock_at("2007-07-20 00:00:00"));

    assert_eq!(checker.segment_state(SEGMENT, true).unwrap().state, SegmentState::OK);
    assert!(checker.check(&NullReporter, false, false).is_ok());
    assert!(checker.repack(&NullReporter, true).unwrap().is_noop());
    assert_eq!(ds.query_all().len(), 2);
}
