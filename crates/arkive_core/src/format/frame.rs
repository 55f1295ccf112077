//! Self-delimiting binary frames.
//!
//! ```text
//! | "FRME" | body_len: u32 BE | reftime: i64 BE unix seconds | attrs "k=v;k=v" | 0x00 | payload | "7777" |
//! ```
//!
//! `body_len` counts everything between the length field and the trailer.

use super::Format;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::types::Time;
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"FRME";
const TRAILER: &[u8; 4] = b"7777";
const HEADER_LEN: usize = 8;

/// The `frame` binary format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameFormat;

impl FrameFormat {
    /// Encodes a frame.
    #[must_use]
    pub fn encode(reftime: &Time, attrs: &BTreeMap<String, String>, payload: &[u8]) -> Vec<u8> {
        let attrs = attrs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        let body_len = 8 + attrs.len() + 1 + payload.len();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len + TRAILER.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.extend_from_slice(&reftime.and_utc().timestamp().to_be_bytes());
        out.extend_from_slice(attrs.as_bytes());
        out.push(0);
        out.extend_from_slice(payload);
        out.extend_from_slice(TRAILER);
        out
    }

    /// Builds a record holding an encoded frame.
    #[must_use]
    pub fn record(reftime: Time, attrs: &[(&str, &str)], payload: &[u8]) -> Record {
        let attrs: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let data = Self::encode(&reftime, &attrs, payload);
        let mut record = Record::new("frame", reftime, data);
        record.attrs = attrs;
        record
    }

    fn body(data: &[u8]) -> CoreResult<&[u8]> {
        if data.len() < HEADER_LEN + TRAILER.len() || &data[..4] != MAGIC {
            return Err(CoreError::corrupted("frame does not start with FRME"));
        }
        let body_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() != HEADER_LEN + body_len + TRAILER.len() {
            return Err(CoreError::corrupted(format!(
                "frame declares {body_len} body bytes but is {} bytes long",
                data.len()
            )));
        }
        if &data[data.len() - TRAILER.len()..] != TRAILER {
            return Err(CoreError::corrupted("frame does not end with 7777"));
        }
        Ok(&data[HEADER_LEN..data.len() - TRAILER.len()])
    }
}

impl Format for FrameFormat {
    fn name(&self) -> &str {
        "frame"
    }

    fn validate(&self, data: &[u8]) -> CoreResult<()> {
        Self::body(data).map(|_| ())
    }

    fn parse(&self, data: &[u8]) -> CoreResult<Record> {
        let body = Self::body(data)?;
        if body.len() < 9 {
            return Err(CoreError::corrupted("frame body is too short"));
        }
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&body[..8]);
        let reftime = chrono::DateTime::from_timestamp(i64::from_be_bytes(stamp), 0)
            .ok_or_else(|| CoreError::corrupted("frame reference time is out of range"))?
            .naive_utc();
        let attrs_end = body[8..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CoreError::corrupted("frame attributes are not terminated"))?;
        let attrs = std::str::from_utf8(&body[8..8 + attrs_end])
            .map_err(|_| CoreError::corrupted("frame attributes are not valid UTF-8"))?;

        let mut record = Record::new("frame", reftime, Vec::new());
        record.data = None;
        for pair in attrs.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| CoreError::corrupted(format!("malformed frame attribute {pair:?}")))?;
            record.attrs.insert(key.to_string(), value.to_string());
        }
        Ok(record)
    }

    fn split(&self, buf: &[u8]) -> Vec<(u64, u64)> {
        let mut spans = Vec::new();
        let mut pos = 0usize;
        while pos + HEADER_LEN + TRAILER.len() <= buf.len() {
            if &buf[pos..pos + 4] != MAGIC {
                pos += 1;
                continue;
            }
            let body_len =
                u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]) as usize;
            let end = pos + HEADER_LEN + body_len + TRAILER.len();
            if end <= buf.len() && &buf[end - TRAILER.len()..end] == TRAILER {
                spans.push((pos as u64, (end - pos) as u64));
                pos = end;
            } else {
                pos += 1;
            }
        }
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_time;

    #[test]
    fn encode_then_parse() {
        let time = parse_time("2007-07-08 13:00:00").unwrap();
        let record = FrameFormat::record(time, &[("origin", "98"), ("product", "t")], b"payload");
        let parsed = FrameFormat.parse(record.bytes().unwrap()).unwrap();
        assert_eq!(parsed.reftime, Some(time));
        assert_eq!(parsed.attr("origin"), Some("98"));
        assert_eq!(parsed.attr("product"), Some("t"));
    }

    #[test]
    fn split_resynchronizes_after_garbage() {
        let time = parse_time("2007-07-08 13:00:00").unwrap();
        let a = FrameFormat::record(time, &[("n", "1")], b"aaa");
        let b = FrameFormat::record(time, &[("n", "2")], b"bbbb");
        let mut buf = b"junkFRME".to_vec();
        let b_start = buf.len() + a.bytes().unwrap().len();
        buf.extend_from_slice(a.bytes().unwrap());
        buf.extend_from_slice(b.bytes().unwrap());

        let spans = FrameFormat.split(&buf);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].0, 8);
        assert_eq!(spans[1], (b_start as u64, b.bytes().unwrap().len() as u64));
    }

    #[test]
    fn validate_detects_damaged_frames() {
        let time = parse_time("2007-07-08 13:00:00").unwrap();
        let record = FrameFormat::record(time, &[], b"data");
        let mut bytes = record.bytes().unwrap().to_vec();
        FrameFormat.validate(&bytes).unwrap();

        bytes[0] = 0;
        assert!(FrameFormat.validate(&bytes).is_err());
        assert!(FrameFormat.validate(&bytes[1..]).is_err());
    }
}
