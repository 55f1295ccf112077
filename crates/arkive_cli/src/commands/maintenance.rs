//! Scan, check, repack and compress commands.

use super::CliError;
use arkive_core::{Action, Dataset, MaintenanceReport, Reporter, SegmentState};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Prints maintenance findings as they happen, one line each.
#[derive(Debug)]
pub struct PrintReporter {
    dataset: String,
    states: bool,
}

impl PrintReporter {
    /// Creates a reporter for `dataset`. With `states` false only actions
    /// and notes are printed.
    pub fn new(dataset: &str, states: bool) -> Self {
        Self {
            dataset: dataset.to_string(),
            states,
        }
    }
}

impl Reporter for PrintReporter {
    fn segment_info(&self, relpath: &str, message: &str) {
        println!("{}:{relpath}: {message}", self.dataset);
    }

    fn segment_state(&self, relpath: &str, state: SegmentState) {
        if self.states {
            println!("{}:{relpath}: {state}", self.dataset);
        }
    }

    fn segment_action(&self, relpath: &str, action: Action, simulated: bool, message: &str) {
        let mode = if simulated { " (simulated)" } else { "" };
        println!("{}:{relpath}: {action}{mode}: {message}", self.dataset);
    }
}

/// Scan output.
#[derive(Debug, Serialize)]
pub struct ScanResult {
    /// Dataset name.
    pub dataset: String,
    /// State name of every segment.
    pub segments: BTreeMap<String, String>,
    /// Whether every segment is OK.
    pub clean: bool,
}

/// Runs the scan command.
pub fn scan(dataset: &Dataset, quick: bool, output: &str) -> Result<(), CliError> {
    let name = &dataset.config().name;
    let json = match output {
        "json" => true,
        "text" => false,
        other => return Err(CliError::Usage(format!("unknown output format {other:?}"))),
    };
    let reporter = PrintReporter::new(name, !json);
    let states = if json {
        dataset.checker().scan(&arkive_core::NullReporter, quick)?
    } else {
        dataset.checker().scan(&reporter, quick)?
    };

    if json {
        let result = ScanResult {
            dataset: name.clone(),
            clean: states.values().all(|s| s.is_ok()),
            segments: states
                .iter()
                .map(|(relpath, state)| (relpath.clone(), state.to_string()))
                .collect(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&result)
                .map_err(|e| CliError::Usage(format!("cannot encode result: {e}")))?
        );
    } else {
        let dirty = states.values().filter(|s| !s.is_ok()).count();
        println!("{name}: {} segments, {dirty} need attention", states.len());
    }
    Ok(())
}

/// Runs the check command.
pub fn check(dataset: &Dataset, fix: bool, quick: bool) -> Result<(), CliError> {
    let name = &dataset.config().name;
    let report = dataset
        .checker()
        .check(&PrintReporter::new(name, false), fix, quick)?;
    finish(name, "check", &report, fix);
    if report.count(Action::ManualIntervention) > 0 {
        return Err(CliError::Usage(format!(
            "{name}: {} segments need manual intervention",
            report.count(Action::ManualIntervention)
        )));
    }
    Ok(())
}

/// Runs the repack command.
pub fn repack(dataset: &Dataset, fix: bool) -> Result<(), CliError> {
    let name = &dataset.config().name;
    let report = dataset
        .checker()
        .repack(&PrintReporter::new(name, false), fix)?;
    finish(name, "repack", &report, fix);
    Ok(())
}

/// Runs the compress command.
pub fn compress(dataset: &Dataset, group_size: usize) -> Result<(), CliError> {
    if group_size == 0 {
        return Err(CliError::Usage("group size must be at least 1".into()));
    }
    let name = &dataset.config().name;
    let report = dataset
        .checker()
        .compress(&PrintReporter::new(name, false), group_size)?;
    finish(name, "compress", &report, true);
    Ok(())
}

fn finish(name: &str, operation: &str, report: &MaintenanceReport, fix: bool) {
    info!(dataset = name, operation, fix, "done");
    if fix {
        println!("{name}: {report}");
    } else {
        println!("{name}: {report} (simulated, use --fix to apply)");
    }
}
