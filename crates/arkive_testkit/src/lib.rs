//! # Arkive Testkit
//!
//! Test utilities for arkive.
//!
//! This crate provides:
//! - Temporary datasets and record helpers
//! - Property-based generators for records and steps
//! - A storage backend that fails on demand
//! - Canned fault scenarios for exercising the checker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arkive_testkit::prelude::*;
//!
//! #[test]
//! fn hole_is_dirty() {
//!     let ds = TestDataset::new();
//!     ds.fill_day("2007-07-08", 3);
//!     Scenario::HoleAtStart.apply(&ds.checker(), "2007/07-08.vm2").unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod failing;
pub mod fixtures;
pub mod generators;
pub mod scenarios;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::failing::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenarios::*;
}

pub use failing::*;
pub use fixtures::*;
pub use generators::*;
pub use scenarios::*;
