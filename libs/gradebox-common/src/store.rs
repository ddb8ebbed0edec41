//! Submission Store seam
//!
//! The grading engine does not own submissions. Its only write is the
//! `analysis` text of a record that may have been deleted by the time the
//! background analysis finishes.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Set the `analysis` field of a submission.
    ///
    /// Returns `Ok(false)` when no such submission exists.
    async fn write_analysis(&self, submission_id: &str, analysis: &str) -> Result<bool>;
}

/// In-process store, used by the CLI and tests
#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    analyses: Mutex<HashMap<String, Option<String>>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a submission so analysis can be written to it
    pub fn insert(&self, submission_id: impl Into<String>) {
        if let Ok(mut analyses) = self.analyses.lock() {
            analyses.entry(submission_id.into()).or_insert(None);
        }
    }

    pub fn analysis(&self, submission_id: &str) -> Option<String> {
        self.analyses
            .lock()
            .ok()
            .and_then(|analyses| analyses.get(submission_id).cloned().flatten())
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn write_analysis(&self, submission_id: &str, analysis: &str) -> Result<bool> {
        let mut analyses = self
            .analyses
            .lock()
            .map_err(|_| crate::error::GradingError::Store("store lock poisoned".to_string()))?;
        match analyses.get_mut(submission_id) {
            Some(slot) => {
                *slot = Some(analysis.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
