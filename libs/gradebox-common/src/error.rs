//! Error taxonomy for the grading engine
//!
//! Only conditions the caller must act on are errors. A submission that
//! crashes, times out or returns the wrong value is a failed test result,
//! never a `GradingError`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GradingError {
    /// Missing or invalid problem definitions; raised at load time
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Problem index {index} out of range ({available} problems configured)")]
    ProblemNotFound { index: usize, available: usize },
    /// The container engine cannot be reached or refused an operation
    #[error("Execution environment unavailable: {0}")]
    Environment(String),
    #[error("Workspace I/O failed: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("Submission store error: {0}")]
    Store(String),
    #[error("Analysis failed: {0}")]
    Analysis(String),
}

impl GradingError {
    pub fn config(message: impl Into<String>) -> Self {
        GradingError::Config(message.into())
    }

    /// Whether the failure lies with the host rather than the request
    pub fn is_environment(&self) -> bool {
        matches!(self, GradingError::Environment(_) | GradingError::Workspace(_))
    }
}

impl From<redis::RedisError> for GradingError {
    fn from(err: redis::RedisError) -> Self {
        GradingError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GradingError>;
