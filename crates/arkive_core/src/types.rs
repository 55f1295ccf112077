//! Time types shared across the engine.

use crate::error::{CoreError, CoreResult};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference time: UTC, second precision.
pub type Time = NaiveDateTime;

/// Textual form of times in manifests and indexes.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats a time the way manifests and indexes store it.
#[must_use]
pub fn format_time(time: &Time) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parses a time stored by [`format_time`].
///
/// # Errors
///
/// Returns [`CoreError::Corrupted`] if the string is not a valid time.
pub fn parse_time(text: &str) -> CoreResult<Time> {
    NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT)
        .map_err(|e| CoreError::corrupted(format!("invalid time {text:?}: {e}")))
}

/// An inclusive time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    /// First instant covered.
    pub begin: Time,
    /// Last instant covered.
    pub end: Time,
}

impl TimeSpan {
    /// Creates a span, swapping the bounds if they are reversed.
    #[must_use]
    pub fn new(begin: Time, end: Time) -> Self {
        if begin <= end {
            Self { begin, end }
        } else {
            Self {
                begin: end,
                end: begin,
            }
        }
    }

    /// Creates a span covering a single instant.
    #[must_use]
    pub fn instant(time: Time) -> Self {
        Self {
            begin: time,
            end: time,
        }
    }

    /// Returns true if `time` falls within the span.
    #[must_use]
    pub fn contains(&self, time: &Time) -> bool {
        self.begin <= *time && *time <= self.end
    }

    /// Returns true if `other` lies entirely within this span.
    #[must_use]
    pub fn contains_span(&self, other: &TimeSpan) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Returns true if the two spans share at least one instant.
    #[must_use]
    pub fn intersects(&self, other: &TimeSpan) -> bool {
        !(self.end < other.begin || other.end < self.begin)
    }

    /// Returns the smallest span covering both.
    #[must_use]
    pub fn merge(&self, other: &TimeSpan) -> Self {
        Self {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }

    /// Grows the span to include `time`.
    pub fn extend(&mut self, time: Time) {
        self.begin = self.begin.min(time);
        self.end = self.end.max(time);
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", format_time(&self.begin), format_time(&self.end))
    }
}

/// Merges an optional span with another.
#[must_use]
pub fn merge_spans(acc: Option<TimeSpan>, span: TimeSpan) -> Option<TimeSpan> {
    Some(match acc {
        Some(acc) => acc.merge(&span),
        None => span,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Time {
        parse_time(s).unwrap()
    }

    #[test]
    fn time_text_round_trip() {
        let time = t("2007-07-08 13:00:00");
        assert_eq!(format_time(&time), "2007-07-08 13:00:00");
        assert!(parse_time("2007-07-08T13").is_err());
    }

    #[test]
    fn span_bounds_are_inclusive() {
        let span = TimeSpan::new(t("2007-07-08 00:00:00"), t("2007-07-08 23:59:59"));
        assert!(span.contains(&t("2007-07-08 00:00:00")));
        assert!(span.contains(&t("2007-07-08 23:59:59")));
        assert!(!span.contains(&t("2007-07-09 00:00:00")));
    }

    #[test]
    fn span_intersection() {
        let a = TimeSpan::new(t("2007-07-01 00:00:00"), t("2007-07-10 00:00:00"));
        let b = TimeSpan::new(t("2007-07-10 00:00:00"), t("2007-07-20 00:00:00"));
        let c = TimeSpan::new(t("2007-07-11 00:00:00"), t("2007-07-20 00:00:00"));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.merge(&c), TimeSpan::new(a.begin, c.end));
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let span = TimeSpan::new(t("2007-07-10 00:00:00"), t("2007-07-01 00:00:00"));
        assert!(span.begin < span.end);
    }
}
