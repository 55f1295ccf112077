//! Records and their storage sources.

use crate::error::{CoreError, CoreResult};
use crate::types::{format_time, Time};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Digest identifying a record for duplicate detection.
pub type UniqueKey = [u8; 32];

/// Where a record's bytes live.
///
/// For directory segments `offset` is the member sequence number; for
/// compressed segments it is the offset in the uncompressed stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    /// Format of the bytes.
    pub format: String,
    /// Dataset root.
    pub basedir: PathBuf,
    /// Segment path relative to `basedir`.
    pub relpath: String,
    /// Start of the record inside the segment.
    pub offset: u64,
    /// Length of the record, excluding padding.
    pub size: u64,
}

impl Source {
    /// Creates a source.
    #[must_use]
    pub fn new(
        format: impl Into<String>,
        basedir: impl Into<PathBuf>,
        relpath: impl Into<String>,
        offset: u64,
        size: u64,
    ) -> Self {
        Self {
            format: format.into(),
            basedir: basedir.into(),
            relpath: relpath.into(),
            offset,
            size,
        }
    }

    /// Returns the first byte after the record.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Returns the absolute path of the segment.
    #[must_use]
    pub fn abspath(&self) -> PathBuf {
        self.basedir.join(&self.relpath)
    }
}

/// An immutable item of scientific data with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Format tag.
    pub format: String,
    /// Reference time, if the scanner could determine one.
    pub reftime: Option<Time>,
    /// Domain-specific facets.
    pub attrs: BTreeMap<String, String>,
    /// Location in a segment once stored.
    pub source: Option<Source>,
    /// The encoded record, when loaded.
    #[serde(skip)]
    pub data: Option<Bytes>,
}

impl Record {
    /// Creates a record carrying its encoded bytes.
    #[must_use]
    pub fn new(format: impl Into<String>, reftime: Time, data: impl Into<Bytes>) -> Self {
        Self {
            format: format.into(),
            reftime: Some(reftime),
            attrs: BTreeMap::new(),
            source: None,
            data: Some(data.into()),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Returns an attribute value.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Returns the stored source.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the record has not been stored.
    pub fn stored_source(&self) -> CoreResult<&Source> {
        self.source
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("record has no source"))
    }

    /// Returns the encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the bytes are not loaded.
    pub fn bytes(&self) -> CoreResult<&Bytes> {
        self.data
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("record data is not loaded"))
    }

    /// Returns true if the record is stored in the segment `relpath`.
    #[must_use]
    pub fn is_in(&self, relpath: &str) -> bool {
        self.source.as_ref().is_some_and(|s| s.relpath == relpath)
    }

    /// Computes the unique key over the reference time and `fields`.
    ///
    /// A missing attribute contributes an empty value, so two records
    /// lacking the same attribute still collide.
    #[must_use]
    pub fn unique_key(&self, fields: &[String]) -> UniqueKey {
        let mut hasher = Sha256::new();
        if let Some(reftime) = &self.reftime {
            hasher.update(format_time(reftime).as_bytes());
        }
        hasher.update([0u8]);
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update(b"=");
            hasher.update(self.attr(field).unwrap_or_default().as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().into()
    }

    /// Returns a copy without the encoded bytes.
    #[must_use]
    pub fn without_data(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }
}

/// Sort key putting records in canonical query order.
pub(crate) fn index_order(record: &Record) -> (Option<Time>, u64) {
    (record.reftime, record.source.as_ref().map_or(0, |s| s.offset))
}

/// Sorts records by reference time, then by offset.
pub(crate) fn sort_index_order(records: &mut [Record]) {
    records.sort_by_key(index_order);
}

/// Returns the relative name of `path` under `root`, with `/` separators.
pub(crate) fn relpath_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_time;

    fn record(station: &str) -> Record {
        Record::new("vm2", parse_time("2007-07-08 13:00:00").unwrap(), "x")
            .with_attr("station", station)
            .with_attr("variable", "227")
    }

    #[test]
    fn unique_key_depends_on_selected_fields() {
        let fields = vec!["station".to_string()];
        assert_eq!(record("1").unique_key(&fields), record("1").unique_key(&fields));
        assert_ne!(record("1").unique_key(&fields), record("2").unique_key(&fields));

        let other_variable = record("1").with_attr("variable", "228");
        assert_eq!(record("1").unique_key(&fields), other_variable.unique_key(&fields));
    }

    #[test]
    fn unique_key_includes_reftime() {
        let fields = vec!["station".to_string()];
        let mut later = record("1");
        later.reftime = Some(parse_time("2007-07-08 14:00:00").unwrap());
        assert_ne!(record("1").unique_key(&fields), later.unique_key(&fields));
    }

    #[test]
    fn index_order_sorts_by_time_then_offset() {
        let mut a = record("1");
        a.source = Some(Source::new("vm2", "/ds", "2007/07-08.vm2", 40, 10));
        let mut b = record("1");
        b.source = Some(Source::new("vm2", "/ds", "2007/07-08.vm2", 0, 10));
        let mut c = record("1");
        c.reftime = Some(parse_time("2007-07-08 12:00:00").unwrap());
        c.source = Some(Source::new("vm2", "/ds", "2007/07-08.vm2", 80, 10));

        let mut records = vec![a, b, c];
        sort_index_order(&mut records);
        let offsets: Vec<u64> = records.iter().map(|r| r.source.as_ref().unwrap().offset).collect();
        assert_eq!(offsets, vec![80, 0, 40]);
    }

    #[test]
    fn relpath_uses_forward_slashes() {
        let root = Path::new("/ds");
        assert_eq!(
            relpath_of(root, &root.join("2007").join("07-08.vm2")).as_deref(),
            Some("2007/07-08.vm2")
        );
        assert!(relpath_of(root, Path::new("/other/x")).is_none());
    }
}
