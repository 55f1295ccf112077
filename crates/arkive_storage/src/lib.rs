//! # Arkive Storage
//!
//! Byte-store backends for arkive segments.
//!
//! Backends are **opaque byte stores**: they know nothing about records,
//! formats, indexes or locks. A concatenation segment is one
//! [`FileBackend`]; a compressed segment decompresses into an
//! [`InMemoryBackend`] when it needs to be checked.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, flush, truncate)
//! - Offsets returned by `append` reflect the real end of the store, even
//!   when another process appended since it was opened
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Example
//!
//! ```rust
//! use arkive_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
