//! # Arkive Core
//!
//! Segmented, indexed archive engine for immutable scientific records.
//!
//! This crate provides:
//! - Segment storage in three on-disk kinds (concatenated, directory,
//!   lz4-compressed)
//! - Indexes mapping time ranges to segments and segments to records
//! - Two-phase append transactions coupling data and index changes
//! - A maintenance engine that classifies and repairs segments
//! - Advisory file locks coordinating readers, writers and checkers
//!
//! ## Example
//!
//! ```rust,no_run
//! use arkive_core::{AcquireResult, Dataset, DatasetConfig, Query, Vm2Format, parse_time};
//!
//! let ds = Dataset::open(DatasetConfig::new("/srv/arkive/obs", "obs", "vm2"))?;
//! let mut record = Vm2Format::record(parse_time("2007-07-08 13:00:00")?, "1", "227", "1.2");
//! assert_eq!(ds.writer().acquire(&mut record), AcquireResult::Ok);
//!
//! for record in ds.reader().query(&Query::all())? {
//!     println!("{:?}", record?.source);
//! }
//! # Ok::<(), arkive_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
mod dataset;
pub mod dir;
mod error;
pub mod format;
pub mod index;
pub mod lock;
pub mod maintenance;
mod record;
pub mod segment;
mod step;
pub mod transaction;
mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    DatasetConfig, IndexKind, LockMode, ReplaceStrategy, SegmentKind, UntrustedDirtyPolicy,
};
pub use dataset::{AcquireResult, Dataset, PreparedAppend, Query, QueryStream, Reader, Writer};
pub use dir::{DatasetDir, Flag};
pub use error::{CoreError, CoreResult};
pub use format::{Format, FormatRegistry, FrameFormat, Vm2Format};
pub use maintenance::{Action, Checker, MaintenanceReport, NullReporter, ReportLog, Reporter};
pub use record::{Record, Source, UniqueKey};
pub use segment::{Segment, SegmentCheck, SegmentState};
pub use step::Step;
pub use transaction::{Pending, PendingState};
pub use types::{format_time, merge_spans, parse_time, Time, TimeSpan};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
