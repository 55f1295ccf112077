//! Line-oriented station observations.
//!
//! One record per line: `YYYYMMDDHHMM[SS],station,variable,value[,...]`.

use super::Format;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::types::Time;
use chrono::NaiveDateTime;

/// The `vm2` line format.
#[derive(Debug, Default, Clone, Copy)]
pub struct Vm2Format;

impl Vm2Format {
    /// Encodes one observation as a line, without the trailing newline.
    #[must_use]
    pub fn line(reftime: &Time, station: &str, variable: &str, value: &str) -> String {
        format!("{},{station},{variable},{value}", reftime.format("%Y%m%d%H%M%S"))
    }

    /// Builds a record for one observation.
    #[must_use]
    pub fn record(reftime: Time, station: &str, variable: &str, value: &str) -> Record {
        Record::new("vm2", reftime, Self::line(&reftime, station, variable, value))
            .with_attr("station", station)
            .with_attr("variable", variable)
            .with_attr("value", value)
    }

    fn fields(data: &[u8]) -> CoreResult<(Time, Vec<&str>)> {
        let line = std::str::from_utf8(data)
            .map_err(|_| CoreError::corrupted("vm2 line is not valid UTF-8"))?;
        if line.contains('\n') {
            return Err(CoreError::corrupted("vm2 record spans more than one line"));
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            return Err(CoreError::corrupted(format!(
                "vm2 line has {} fields, at least 4 are required",
                fields.len()
            )));
        }
        let stamp = fields[0];
        let reftime = match stamp.len() {
            12 => NaiveDateTime::parse_from_str(&format!("{stamp}00"), "%Y%m%d%H%M%S"),
            14 => NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S"),
            _ => return Err(CoreError::corrupted(format!("invalid vm2 time {stamp:?}"))),
        }
        .map_err(|e| CoreError::corrupted(format!("invalid vm2 time {stamp:?}: {e}")))?;
        if fields[1].is_empty() || fields[2].is_empty() {
            return Err(CoreError::corrupted("vm2 line has empty station or variable"));
        }
        Ok((reftime, fields))
    }
}

impl Format for Vm2Format {
    fn name(&self) -> &str {
        "vm2"
    }

    fn padding(&self) -> &'static [u8] {
        b"\n"
    }

    fn default_unique(&self) -> Vec<String> {
        vec!["station".to_string(), "variable".to_string()]
    }

    fn validate(&self, data: &[u8]) -> CoreResult<()> {
        Self::fields(data).map(|_| ())
    }

    fn parse(&self, data: &[u8]) -> CoreResult<Record> {
        let (reftime, fields) = Self::fields(data)?;
        let mut record = Record::new("vm2", reftime, Vec::new())
            .with_attr("station", fields[1])
            .with_attr("variable", fields[2])
            .with_attr("value", fields[3]);
        record.data = None;
        Ok(record)
    }

    fn split(&self, buf: &[u8]) -> Vec<(u64, u64)> {
        let mut spans = Vec::new();
        let mut start = 0usize;
        for (pos, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                if pos > start {
                    spans.push((start as u64, (pos - start) as u64));
                }
                start = pos + 1;
            }
        }
        if start < buf.len() {
            spans.push((start as u64, (buf.len() - start) as u64));
        }
        spans
    }
}
