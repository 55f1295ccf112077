//! Two-phase mutations of segments and indexes.
//!
//! Every change is staged as a [`Pending`] that is either committed or
//! rolled back; dropping it unresolved rolls it back. An append chains the
//! data pending before the index pending so that committed index entries
//! always point at durable bytes.

mod append;
mod pending;

pub use append::{stage_append, StagedAppend};
pub use pending::{Pending, PendingState, Transaction};
