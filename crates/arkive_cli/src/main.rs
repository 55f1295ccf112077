//! Arkive CLI
//!
//! Command-line tools for operating arkive datasets.
//!
//! # Commands
//!
//! - `scan` - Report the state of every segment
//! - `check` - Repair segments whose index disagrees with the data
//! - `repack` - Reclaim holes, archive and delete old segments
//! - `compress` - Rewrite clean segments as lz4 blocks
//! - `query` - Print records matching a time range and attributes
//! - `summary` - Print record count, size and time coverage

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Arkive command-line dataset tools.
#[derive(Parser)]
#[command(name = "arkive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Dataset configuration file (JSON)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Dataset root directory, when no configuration file is given
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Record format of a dataset opened by path
    #[arg(global = true, long, default_value = "vm2")]
    format: String,

    /// Fail instead of waiting for locks held by other processes
    #[arg(global = true, long)]
    no_wait: bool,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the state of every segment
    Scan {
        /// Skip record validation
        #[arg(short, long)]
        quick: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: String,
    },

    /// Find and repair segments whose index disagrees with the data
    Check {
        /// Perform the repairs instead of reporting them
        #[arg(short, long)]
        fix: bool,

        /// Skip record validation
        #[arg(short, long)]
        quick: bool,
    },

    /// Repack dirty segments and apply the age policy
    Repack {
        /// Perform the changes instead of reporting them
        #[arg(short, long)]
        fix: bool,
    },

    /// Rewrite clean segments as lz4 blocks
    Compress {
        /// Records per compressed block
        #[arg(short, long, default_value_t = 512)]
        group_size: usize,
    },

    /// Print matching records
    Query {
        /// First reference time (YYYY-MM-DD HH:MM:SS)
        #[arg(short, long)]
        begin: Option<String>,

        /// Last reference time (YYYY-MM-DD HH:MM:SS)
        #[arg(short, long)]
        end: Option<String>,

        /// Required attribute value, as key=value
        #[arg(short, long = "attr")]
        attrs: Vec<String>,

        /// Print record bytes instead of metadata
        #[arg(short, long)]
        data: bool,
    },

    /// Print record count, size and time coverage
    Summary {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("Arkive CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("Arkive Core v{}", arkive_core::VERSION);
        return Ok(());
    }

    let source = commands::DatasetSource {
        config: cli.config,
        path: cli.path,
        format: cli.format,
        no_wait: cli.no_wait,
    };
    let dataset = source.open()?;

    match cli.command {
        Commands::Scan { quick, output } => {
            commands::maintenance::scan(&dataset, quick, &output)?;
        }
        Commands::Check { fix, quick } => {
            commands::maintenance::check(&dataset, fix, quick)?;
        }
        Commands::Repack { fix } => {
            commands::maintenance::repack(&dataset, fix)?;
        }
        Commands::Compress { group_size } => {
            commands::maintenance::compress(&dataset, group_size)?;
        }
        Commands::Query {
            begin,
            end,
            attrs,
            data,
        } => {
            let query = commands::query::build(begin.as_deref(), end.as_deref(), &attrs, data)?;
            commands::query::run(&dataset, &query)?;
        }
        Commands::Summary { output } => {
            commands::summary::run(&dataset, &output)?;
        }
        Commands::Version => {}
    }

    Ok(())
}
