//! Error types for arkive core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in arkive core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(arkive_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Embedded sqlite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A segment, record or index file does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
    },

    /// A read extends past the end of a segment.
    #[error("{}: cannot read {size} bytes at offset {offset}: segment is only {file_size} bytes", path.display())]
    Truncated {
        /// Path of the segment.
        path: PathBuf,
        /// Requested offset.
        offset: u64,
        /// Requested size.
        size: u64,
        /// Actual size of the segment.
        file_size: u64,
    },

    /// Structural violation requiring manual intervention or a fix run.
    #[error("corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A non-blocking lock acquisition found the lock already held.
    #[error("{}: lock already held", path.display())]
    LockConflict {
        /// The lock file.
        path: PathBuf,
    },

    /// A record with the same unique key is already in the segment.
    #[error("{relpath}: a record with the same unique key already exists")]
    DuplicateKey {
        /// Segment holding the existing record.
        relpath: String,
    },

    /// A manifest line could not be parsed.
    #[error("parsing {}:{line}: {message}", path.display())]
    ManifestParse {
        /// The manifest file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// What is wrong with the line.
        message: String,
    },

    /// CBOR sidecar encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The dataset configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Repack refused until a successful check with fix has run.
    #[error("{}: dataset needs checking first", path.display())]
    NeedsCheck {
        /// The dataset root.
        path: PathBuf,
    },
}

impl From<arkive_storage::StorageError> for CoreError {
    fn from(err: arkive_storage::StorageError) -> Self {
        match err {
            arkive_storage::StorageError::NotFound(path) => Self::NotFound {
                what: path.display().to_string(),
            },
            other => Self::Storage(other),
        }
    }
}

impl CoreError {
    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by a contended non-blocking lock.
    #[must_use]
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_not_found() {
        let err: CoreError =
            arkive_storage::StorageError::NotFound(PathBuf::from("2007/07-08.vm2")).into();
        assert!(matches!(err, CoreError::NotFound { what } if what == "2007/07-08.vm2"));
    }

    #[test]
    fn manifest_parse_message_names_line() {
        let err = CoreError::ManifestParse {
            path: PathBuf::from("/ds/MANIFEST"),
            line: 3,
            message: "line has only 2 fields".into(),
        };
        assert_eq!(
            err.to_string(),
            "parsing /ds/MANIFEST:3: line has only 2 fields"
        );
    }
}
