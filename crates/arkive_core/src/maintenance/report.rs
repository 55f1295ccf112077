//! Reporting of maintenance findings and actions.

use crate::segment::SegmentState;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;

/// An action taken (or, in simulation, proposed) on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    /// Rewritten without holes, in index order.
    Repacked,
    /// Moved under `.archive/last`.
    Archived,
    /// Rewritten as lz4 blocks.
    Compressed,
    /// Data and index removed.
    Deleted,
    /// Index rebuilt from the segment contents.
    Rescanned,
    /// Index entry dropped for data that is gone.
    Deindexed,
    /// Needs an operator.
    ManualIntervention,
}

impl Action {
    /// Returns the lowercase name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Action::Repacked => "repacked",
            Action::Archived => "archived",
            Action::Compressed => "compressed",
            Action::Deleted => "deleted",
            Action::Rescanned => "rescanned",
            Action::Deindexed => "deindexed",
            Action::ManualIntervention => "manual_intervention",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives what maintenance finds and does.
pub trait Reporter: Send + Sync {
    /// A free-form observation about a segment.
    fn segment_info(&self, relpath: &str, message: &str);

    /// The state computed for a segment.
    fn segment_state(&self, relpath: &str, state: SegmentState);

    /// An action on a segment. `simulated` is true when nothing was changed.
    fn segment_action(&self, relpath: &str, action: Action, simulated: bool, message: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn segment_info(&self, _relpath: &str, _message: &str) {}
    fn segment_state(&self, _relpath: &str, _state: SegmentState) {}
    fn segment_action(&self, _relpath: &str, _action: Action, _simulated: bool, _message: &str) {}
}

/// One reported line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEntry {
    /// From [`Reporter::segment_info`].
    Info {
        /// Segment.
        relpath: String,
        /// Text.
        message: String,
    },
    /// From [`Reporter::segment_state`].
    State {
        /// Segment.
        relpath: String,
        /// State found.
        state: SegmentState,
    },
    /// From [`Reporter::segment_action`].
    Action {
        /// Segment.
        relpath: String,
        /// What was done.
        action: Action,
        /// True if nothing was changed.
        simulated: bool,
        /// Text.
        message: String,
    },
}

/// Collects every report in order.
#[derive(Debug, Default)]
pub struct ReportLog {
    entries: Mutex<Vec<ReportEntry>>,
}

impl ReportLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entries so far.
    #[must_use]
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries.lock().clone()
    }

    /// Returns the last state reported per segment.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, SegmentState> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEntry::State { relpath, state } => Some((relpath.clone(), *state)),
                _ => None,
            })
            .collect()
    }

    /// Returns the actions reported, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<(String, Action, bool)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEntry::Action {
                    relpath,
                    action,
                    simulated,
                    ..
                } => Some((relpath.clone(), *action, *simulated)),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for ReportLog {
    fn segment_info(&self, relpath: &str, message: &str) {
        self.entries.lock().push(ReportEntry::Info {
            relpath: relpath.to_string(),
            message: message.to_string(),
        });
    }

    fn segment_state(&self, relpath: &str, state: SegmentState) {
        self.entries.lock().push(ReportEntry::State {
            relpath: relpath.to_string(),
            state,
        });
    }

    fn segment_action(&self, relpath: &str, action: Action, simulated: bool, message: &str) {
        self.entries.lock().push(ReportEntry::Action {
            relpath: relpath.to_string(),
            action,
            simulated,
            message: message.to_string(),
        });
    }
}

/// Totals of one maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Segments examined.
    pub segments: usize,
    /// Actions per kind.
    pub actions: BTreeMap<Action, usize>,
    /// Bytes reclaimed by repack and delete.
    pub bytes_freed: u64,
    /// True if the run stopped early on cancellation.
    pub cancelled: bool,
}

impl MaintenanceReport {
    pub(crate) fn record(&mut self, action: Action) {
        *self.actions.entry(action).or_default() += 1;
    }

    /// Number of times `action` was taken.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.actions.get(&action).copied().unwrap_or(0)
    }

    /// Returns true if no action was taken or proposed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Display for MaintenanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} segments", self.segments)?;
        for (action, count) in &self.actions {
            write!(f, ", {count} {action}")?;
        }
        if self.bytes_freed > 0 {
            write!(f, ", {} bytes freed", self.bytes_freed)?;
        }
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}
