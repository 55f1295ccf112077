//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records that respect the invariants
//! the engine relies on.

use arkive_core::{Record, Step, Time, Vm2Format};
use chrono::NaiveDate;
use proptest::prelude::*;

/// Strategy for reference times between 1990 and 2030.
pub fn reftime_strategy() -> impl Strategy<Value = Time> {
    (1990i32..2030, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60, 0u32..60).prop_map(
        |(y, m, d, hh, mm, ss)| {
            NaiveDate::from_ymd_opt(y, m, d)
                .and_then(|date| date.and_hms_opt(hh, mm, ss))
                .unwrap_or_default()
        },
    )
}

/// Strategy for reference times within one day.
pub fn time_in_day_strategy(day: NaiveDate) -> impl Strategy<Value = Time> {
    (0u32..24, 0u32..60, 0u32..60).prop_map(move |(hh, mm, ss)| {
        day.and_hms_opt(hh, mm, ss)
            .unwrap_or_else(|| day.and_time(chrono::NaiveTime::MIN))
    })
}

/// Strategy for station identifiers.
pub fn station_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[1-9][0-9]{0,3}").expect("Invalid regex")
}

/// Strategy for vm2 values.
pub fn value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("-?[0-9]{1,4}(\\.[0-9]{1,2})?").expect("Invalid regex")
}

/// Strategy for one vm2 record at a time from `times`.
pub fn vm2_record_strategy(
    times: impl Strategy<Value = Time>,
) -> impl Strategy<Value = Record> {
    (times, station_strategy(), value_strategy())
        .prop_map(|(time, station, value)| Vm2Format::record(time, &station, "227", &value))
}

/// Strategy for up to `max` vm2 records on `day`, with distinct unique keys,
/// in reference time order.
pub fn vm2_day_strategy(day: NaiveDate, max: usize) -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(vm2_record_strategy(time_in_day_strategy(day)), 1..=max).prop_map(
        |records| {
            let mut seen = std::collections::HashSet::new();
            let mut records: Vec<Record> = records
                .into_iter()
                .filter(|r| seen.insert((r.reftime, r.attr("station").map(str::to_string))))
                .collect();
            records.sort_by_key(|r| r.reftime);
            records
        },
    )
}

/// Strategy for partitioning steps.
pub fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Daily),
        Just(Step::Weekly),
        Just(Step::Biweekly),
        Just(Step::Monthly),
        Just(Step::Yearly),
    ]
}
