use std::path::PathBuf;

use thiserror::Error;

use crate::matrix::MatrixError;

/// Errors that abort a run before any job is dispatched.
///
/// Everything that goes wrong inside a job is classified into a
/// [`Failure`](crate::scheduler::policy::Failure) instead and never surfaces here.
#[derive(Error, Debug)]
pub enum SisyphusError {
    #[error("Invalid build matrix: {0}")]
    Matrix(#[from] MatrixError),

    #[error("No host in the inventory provides {tags:?} required by {target}")]
    UnmatchedCapabilities { target: String, tags: Vec<String> },

    #[error("Invalid host inventory: {0}")]
    Inventory(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, SisyphusError>;
