//! Query command implementation.

use super::CliError;
use arkive_core::{format_time, parse_time, CoreError, Dataset, Query, Time, TimeSpan};
use std::io::Write;

/// Builds a query from command-line arguments.
pub fn build(
    begin: Option<&str>,
    end: Option<&str>,
    attrs: &[String],
    with_data: bool,
) -> Result<Query, CliError> {
    let time = |text: &str| {
        parse_time(text).map_err(|e| CliError::Usage(format!("invalid time {text:?}: {e}")))
    };
    let span = match (begin, end) {
        (None, None) => None,
        (Some(b), None) => Some(TimeSpan::new(time(b)?, Time::MAX)),
        (None, Some(e)) => Some(TimeSpan::new(Time::MIN, time(e)?)),
        (Some(b), Some(e)) => Some(TimeSpan::new(time(b)?, time(e)?)),
    };
    let mut query = Query {
        span,
        ..Query::all()
    }
    .with_data(with_data);
    for attr in attrs {
        let (key, value) = attr
            .split_once('=')
            .ok_or_else(|| CliError::Usage(format!("attribute {attr:?} is not key=value")))?;
        query = query.with_attr(key, value);
    }
    Ok(query)
}

/// Runs the query command.
pub fn run(dataset: &Dataset, query: &Query) -> Result<(), CliError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for record in dataset.reader().query(query)? {
        let record = record?;
        let written = if query.with_data {
            let data = record.bytes()?;
            out.write_all(data).and_then(|()| out.write_all(b"\n"))
        } else {
            let source = record.stored_source()?;
            let time = record.reftime.map(|t| format_time(&t)).unwrap_or_default();
            let attrs: Vec<String> = record.attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            writeln!(
                out,
                "{}:{}+{} {time} {}",
                source.relpath,
                source.offset,
                source.size,
                attrs.join(",")
            )
        };
        written.map_err(CoreError::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_ended_ranges() {
        let query = build(Some("2007-07-08 00:00:00"), None, &[], false).unwrap();
        let span = query.span.unwrap();
        assert_eq!(span.begin, parse_time("2007-07-08 00:00:00").unwrap());
        assert!(span.contains(&parse_time("2100-01-01 00:00:00").unwrap()));

        assert!(build(None, None, &[], true).unwrap().span.is_none());
    }

    #[test]
    fn attributes_are_key_value_pairs() {
        let query = build(None, None, &["station=1".into()], false).unwrap();
        assert_eq!(query.attrs.get("station").map(String::as_str), Some("1"));
        assert!(build(None, None, &["station".into()], false).is_err());
        assert!(build(Some("yesterday"), None, &[], false).is_err());
    }
}
