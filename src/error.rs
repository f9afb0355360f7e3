//! Error taxonomy for dataset, model and output failures

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the library boundary.
///
/// Nothing in the crate recovers from these; the binary reports them and
/// exits non-zero.
#[derive(Debug, Error)]
pub enum SurprisalError {
    #[error("dataset not found: {}", .0.display())]
    DatasetNotFound(PathBuf),
    #[error("malformed CSV in {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("failed to load model '{model_id}': {reason}")]
    ModelLoad { model_id: String, reason: String },
    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("scoring failed: {0}")]
    Scoring(String),
}

impl SurprisalError {
    pub(crate) fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = SurprisalError> = std::result::Result<T, E>;
