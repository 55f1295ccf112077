//! Time partitioning of records into segments.
//!
//! | step       | relpath stem | covers                          |
//! |------------|--------------|---------------------------------|
//! | `daily`    | `2007/07-08` | one day                         |
//! | `weekly`   | `2007/07-2`  | days 8-14 of the month          |
//! | `biweekly` | `2007/07-1`  | days 1-15 (`-2` is 16-end)      |
//! | `monthly`  | `2007/07`    | one month                       |
//! | `yearly`   | `20/2007`    | one year, under its century     |
//!
//! A segment's relpath is its stem followed by `.` and the format name.

use crate::error::{CoreError, CoreResult};
use crate::types::{Time, TimeSpan};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time partitioning step of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// One segment per day.
    #[default]
    Daily,
    /// One segment per 7-day block of a month.
    Weekly,
    /// One segment per half month.
    Biweekly,
    /// One segment per month.
    Monthly,
    /// One segment per year.
    Yearly,
}

impl Step {
    /// Returns the relpath stem of the segment holding `time`.
    #[must_use]
    pub fn stem(self, time: &Time) -> String {
        let (y, m, d) = (time.year(), time.month(), time.day());
        match self {
            Step::Daily => format!("{y:04}/{m:02}-{d:02}"),
            Step::Weekly => format!("{y:04}/{m:02}-{}", (d - 1) / 7 + 1),
            Step::Biweekly => format!("{y:04}/{m:02}-{}", if d <= 15 { 1 } else { 2 }),
            Step::Monthly => format!("{y:04}/{m:02}"),
            Step::Yearly => format!("{:02}/{y:04}", y / 100),
        }
    }

    /// Returns the relpath of the segment holding `time` for `format`.
    #[must_use]
    pub fn relpath(self, time: &Time, format: &str) -> String {
        format!("{}.{format}", self.stem(time))
    }

    /// Returns the interval covered by the segment named `relpath`.
    ///
    /// Returns `None` if the name does not fit this step.
    #[must_use]
    pub fn timespan(self, relpath: &str) -> Option<TimeSpan> {
        let (dir, file) = relpath.split_once('/')?;
        let (name, format) = file.split_once('.')?;
        if file.contains('/') || format.is_empty() || format.contains('.') {
            return None;
        }
        match self {
            Step::Yearly => {
                let century = digits(dir, 2)?;
                let year = digits(name, 4)?;
                if year / 100 != century {
                    return None;
                }
                day_span(year as i32, 1, 1, 12, 31)
            }
            _ => {
                let year = digits(dir, 4)? as i32;
                let (month, rest) = match name.split_once('-') {
                    Some((month, rest)) => (digits(month, 2)?, Some(rest)),
                    None => (digits(name, 2)?, None),
                };
                if !(1..=12).contains(&month) {
                    return None;
                }
                let last = last_day_of_month(year, month)?;
                match (self, rest) {
                    (Step::Daily, Some(day)) => {
                        let day = digits(day, 2)?;
                        if day == 0 || day > last {
                            return None;
                        }
                        day_span(year, month, day, month, day)
                    }
                    (Step::Weekly, Some(week)) => {
                        let week = digits(week, 1)?;
                        let first = week.checked_sub(1)? * 7 + 1;
                        if week == 0 || first > last {
                            return None;
                        }
                        day_span(year, month, first, month, (week * 7).min(last))
                    }
                    (Step::Biweekly, Some(half)) => match digits(half, 1)? {
                        1 => day_span(year, month, 1, month, 15),
                        2 => day_span(year, month, 16, month, last),
                        _ => None,
                    },
                    (Step::Monthly, None) => day_span(year, month, 1, month, last),
                    _ => None,
                }
            }
        }
    }
}

fn digits(text: &str, len: usize) -> Option<u32> {
    if text.len() != len || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next.pred_opt()?.day())
}

fn day_span(year: i32, m1: u32, d1: u32, m2: u32, d2: u32) -> Option<TimeSpan> {
    let begin = NaiveDate::from_ymd_opt(year, m1, d1)?.and_hms_opt(0, 0, 0)?;
    let end = NaiveDate::from_ymd_opt(year, m2, d2)?.and_hms_opt(23, 59, 59)?;
    Some(TimeSpan { begin, end })
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Daily => "daily",
            Step::Weekly => "weekly",
            Step::Biweekly => "biweekly",
            Step::Monthly => "monthly",
            Step::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

impl FromStr for Step {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "daily" => Ok(Step::Daily),
            "weekly" => Ok(Step::Weekly),
            "biweekly" => Ok(Step::Biweekly),
            "monthly" => Ok(Step::Monthly),
            "yearly" => Ok(Step::Yearly),
            other => Err(CoreError::invalid_config(format!("unknown step {other:?}"))),
        }
    }
}
