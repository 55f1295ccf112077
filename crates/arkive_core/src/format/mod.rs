//! Record formats: validation and scanning of payload bytes.
//!
//! The engine never interprets record bytes itself. A [`Format`] tells it
//! how to validate a record, how to recover records from a segment whose
//! index was lost, and what padding separates records on disk.

mod frame;
mod vm2;

pub use frame::FrameFormat;
pub use vm2::Vm2Format;

use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Format-specific knowledge about record bytes.
pub trait Format: Send + Sync + Debug {
    /// Registry key, also used as the segment file extension.
    fn name(&self) -> &str;

    /// Bytes written after every record in concatenated segments.
    fn padding(&self) -> &'static [u8] {
        b""
    }

    /// Attributes identifying a record when the dataset configures none.
    fn default_unique(&self) -> Vec<String> {
        Vec::new()
    }

    /// Checks that `data` is one well-formed record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] describing the first problem found.
    fn validate(&self, data: &[u8]) -> CoreResult<()>;

    /// Extracts reference time and attributes from one record.
    ///
    /// The returned record has no source and does not keep `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] if the bytes are not a record.
    fn parse(&self, data: &[u8]) -> CoreResult<Record>;

    /// Finds `(offset, size)` spans of candidate records in a concatenation.
    fn split(&self, buf: &[u8]) -> Vec<(u64, u64)>;
}

/// Formats known to a dataset, by name.
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    formats: BTreeMap<String, Arc<dyn Format>>,
}

impl FormatRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            formats: BTreeMap::new(),
        }
    }

    /// Adds or replaces a format.
    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.formats.insert(format.name().to_string(), format);
    }

    /// Looks up a format by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if no such format is registered.
    pub fn get(&self, name: &str) -> CoreResult<Arc<dyn Format>> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::invalid_config(format!("unsupported format {name:?}")))
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Vm2Format));
        registry.register(Arc::new(FrameFormat));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtin_formats() {
        let registry = FormatRegistry::default();
        assert_eq!(registry.get("vm2").unwrap().padding(), b"\n");
        assert!(registry.get("frame").unwrap().padding().is_empty());
        assert!(matches!(
            registry.get("grib"),
            Err(CoreError::InvalidConfig { .. })
        ));
    }
}
