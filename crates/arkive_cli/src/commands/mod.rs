//! CLI command implementations.

pub mod maintenance;
pub mod query;
pub mod summary;

use arkive_core::{CoreError, Dataset, DatasetConfig, LockMode};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors of the command-line layer.
#[derive(Debug, Error)]
pub enum CliError {
    /// The configuration file cannot be read.
    #[error("cannot read {path}: {source}")]
    ConfigRead {
        /// Configuration file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not a valid dataset configuration.
    #[error("invalid configuration in {path}: {source}")]
    ConfigParse {
        /// Configuration file.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Bad command-line arguments.
    #[error("{0}")]
    Usage(String),

    /// The dataset reported an error.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// How the dataset to operate on was named.
#[derive(Debug)]
pub struct DatasetSource {
    /// Configuration file.
    pub config: Option<PathBuf>,
    /// Dataset root.
    pub path: Option<PathBuf>,
    /// Format of a dataset opened by path.
    pub format: String,
    /// Whether lock conflicts fail immediately.
    pub no_wait: bool,
}

impl DatasetSource {
    /// Builds the dataset configuration.
    pub fn config(&self) -> Result<DatasetConfig, CliError> {
        let config = match (&self.config, &self.path) {
            (Some(file), _) => load_config(file)?,
            (None, Some(root)) => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "dataset".to_string());
                DatasetConfig::new(root, name, self.format.clone())
            }
            (None, None) => {
                return Err(CliError::Usage(
                    "a dataset is required: use --config or --path".into(),
                ))
            }
        };
        let config = config.create_if_missing(false);
        Ok(if self.no_wait {
            config.locking(LockMode::NonBlocking)
        } else {
            config
        })
    }

    /// Opens the dataset.
    pub fn open(&self) -> Result<Dataset, CliError> {
        Ok(Dataset::open(self.config()?)?)
    }
}

/// Reads a JSON dataset configuration.
pub fn load_config(path: &Path) -> Result<DatasetConfig, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}
