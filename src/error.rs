//! Error types for the stacking pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the library.
///
/// `DataIntegrity` and `MetricUndefined` abort the unit of work that hit
/// them. `ProbabilityUnavailable` is returned by models without probability
/// output; callers query [`crate::model::FittedModel::supports_proba`] first
/// and fall back to hard labels.
#[derive(Debug, Error)]
pub enum ToxError {
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Metric undefined: {0}")]
    MetricUndefined(String),

    #[error("Probability output unavailable for model {0}")]
    ProbabilityUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ToxError {
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error ends the run instead of a single unit of work
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ToxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ToxError::integrity("drug 'x' missing from sages");
        assert_eq!(
            err.to_string(),
            "Data integrity error: drug 'x' missing from sages"
        );

        let err = ToxError::io(
            "out/level1_summary.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("level1_summary.csv"));
    }
}
