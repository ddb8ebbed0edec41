use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Harness flavour used inside the execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    JavaScript,
}

impl Language {
    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
        }
    }

    /// Name of the submitted code file inside the workspace
    pub fn solution_file(&self) -> String {
        format!("solution.{}", self.file_extension())
    }

    /// Name of the generated entry script inside the workspace
    pub fn harness_file(&self) -> String {
        format!("harness.{}", self.file_extension())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
        }
    }
}

/// Test Case Definition (Immutable Input)
/// `id` is the 1-based position in the configured test list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub parameters: Vec<Value>,
    pub expected_output: Value,
}

/// Chat-completion parameters for the analysis call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisModelParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

/// One gradable problem of a deployment.
///
/// `analysis_enabled` holds exactly when `analysis_model_params` is present;
/// the catalog is the only producer and keeps the two in step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfiguration {
    pub problem_index: usize,
    pub function_name: String,
    pub description: String,
    pub parameter_names: Vec<String>,
    pub test_cases: Vec<TestCase>,
    pub analysis_enabled: bool,
    pub analyze_on_success: bool,
    pub analysis_model_params: Option<AnalysisModelParams>,
}

impl ProblemConfiguration {
    /// Human-readable call signature, e.g. `add(a, b)`
    pub fn signature(&self) -> String {
        format!("{}({})", self.function_name, self.parameter_names.join(", "))
    }
}

/// Outcome of running one test case against one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionResult {
    pub test_id: u32,
    pub parameters: Vec<Value>,
    pub expected_output: Value,
    pub actual_output: Option<Value>,
    pub passed: bool,
    pub error: Option<String>,
    #[serde(rename = "execution_time_ms", with = "duration_ms", default)]
    pub execution_time: Option<Duration>,
}

/// Verdict for a whole problem.
///
/// Only built through [`AggregateRunResult::from_results`], so the counters
/// always agree with `test_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRunResult {
    pub all_passed: bool,
    pub test_results: Vec<TestExecutionResult>,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub problem_index: usize,
}

impl AggregateRunResult {
    pub fn from_results(problem_index: usize, test_results: Vec<TestExecutionResult>) -> Self {
        let total_tests = test_results.len();
        let passed_tests = test_results.iter().filter(|r| r.passed).count();
        let failed_tests = total_tests - passed_tests;
        Self {
            all_passed: failed_tests == 0,
            test_results,
            total_tests,
            passed_tests,
            failed_tests,
            problem_index,
        }
    }

    /// Ids of the failing test cases, in execution order
    pub fn failed_test_ids(&self) -> Vec<u32> {
        self.test_results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.test_id)
            .collect()
    }
}

/// Queue payload consumed by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub id: Uuid,
    #[serde(default)]
    pub submission_id: Option<String>,
    pub problem_index: usize,
    pub source_code: String,
    #[serde(default)]
    pub runtime_image: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl GradingJob {
    pub fn new(problem_index: usize, source_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_id: None,
            problem_index,
            source_code: source_code.into(),
            runtime_image: None,
            queued_at: Utc::now(),
        }
    }
}

/// What the worker persists for a job: a verdict, or the reason there is none
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AggregateRunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
