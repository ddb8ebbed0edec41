pub mod catalog;
pub mod config;
pub mod error;
pub mod redis;
pub mod store;
pub mod types;
pub mod value;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::GradingError;
pub use store::SubmissionStore;
pub use types::{
    AggregateRunResult, AnalysisModelParams, GradingJob, GradingOutcome, Language,
    ProblemConfiguration, TestCase, TestExecutionResult,
};
pub use value::Value;
