//! Summary command implementation.

use super::CliError;
use arkive_core::{format_time, Dataset};

/// Runs the summary command.
pub fn run(dataset: &Dataset, output: &str) -> Result<(), CliError> {
    let summary = dataset.reader().summary()?;
    match output {
        "json" => {
            let text = serde_json::to_string_pretty(&summary)
                .map_err(|e| CliError::Usage(format!("cannot encode summary: {e}")))?;
            println!("{text}");
        }
        "text" => {
            println!("Dataset:  {}", dataset.config().name);
            println!("Records:  {}", summary.count);
            println!("Size:     {} bytes", summary.size);
            match &summary.span {
                Some(span) => println!(
                    "Coverage: {} to {}",
                    format_time(&span.begin),
                    format_time(&span.end)
                ),
                None => println!("Coverage: none"),
            }
        }
        other => return Err(CliError::Usage(format!("unknown output format {other:?}"))),
    }
    Ok(())
}
