//! Error types for the regression detector.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, validating or comparing metrics.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Datasets are inconsistent. Raised only in strict mode, except for
    /// mixed test counts within one directory.
    #[error("metrics validation failed: {0}")]
    Validation(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid ignore pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl MetricsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MetricsError>;
