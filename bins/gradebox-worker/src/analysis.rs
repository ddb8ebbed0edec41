//! Analysis Scheduler
//!
//! **Core Responsibility:**
//! After grading, ask a chat model for a qualitative review of the submission
//! and attach the text to the submission record, without holding up the
//! grading response.
//!
//! **Failure Semantics:**
//! Model errors, a vanished submission and store errors are logged and
//! dropped. Nothing here is ever reported back to the grading caller.
//!
//! **Scheduling:**
//! Inside a tokio runtime the job is spawned on it. Without one, a dedicated
//! `analysis-worker` thread runs the job on its own current-thread runtime.

use async_trait::async_trait;
use gradebox_common::{
    AggregateRunResult, AnalysisModelParams, Config, GradingError, ProblemConfiguration,
    SubmissionStore,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a programming tutor reviewing a student's solution. \
Point out bugs, explain why failing test cases fail, and suggest improvements. \
Do not rewrite the whole solution.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const IDLE_POLL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("request to model API failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model response carried no content")]
    EmptyResponse,
}

impl From<AnalysisError> for GradingError {
    fn from(err: AnalysisError) -> Self {
        GradingError::Analysis(err.to_string())
    }
}

/// Text-completion backend
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str, params: &AnalysisModelParams) -> Result<String, AnalysisError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client
#[derive(Clone)]
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl OpenAiChatModel {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, AnalysisError> {
        Self::new(config.analysis_api_base.clone(), config.analysis_api_key.clone())
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, prompt: &str, params: &AnalysisModelParams) -> Result<String, AnalysisError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: &params.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        debug!(model = %params.model, "Requesting analysis");
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(AnalysisError::EmptyResponse)
    }
}

/// Everything one analysis job needs, owned so it can outlive the request
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub description: String,
    pub signature: String,
    pub code: String,
    pub result: AggregateRunResult,
    pub params: AnalysisModelParams,
    pub submission_id: Option<String>,
}

impl AnalysisRequest {
    /// `None` when the problem has no analysis model configured
    pub fn new(
        problem: &ProblemConfiguration,
        code: &str,
        result: &AggregateRunResult,
        submission_id: Option<&str>,
    ) -> Option<Self> {
        let params = problem.analysis_model_params.clone()?;
        Some(Self {
            description: problem.description.clone(),
            signature: problem.signature(),
            code: code.to_string(),
            result: result.clone(),
            params,
            submission_id: submission_id.map(str::to_string),
        })
    }
}

pub fn build_prompt(request: &AnalysisRequest) -> String {
    let results = serde_json::to_string_pretty(&request.result.test_results)
        .unwrap_or_else(|_| "[]".to_string());

    format!(
        "## Problem\n{description}\n\n\
         ## Function signature\n{signature}\n\n\
         ## Submitted code\n```\n{code}\n```\n\n\
         ## Test results\n{passed} of {total} test cases passed.\n\n\
         ```json\n{results}\n```\n\n\
         Review the submission. Explain the cause of any failures and how to fix them.",
        description = request.description,
        signature = request.signature,
        code = request.code,
        passed = request.result.passed_tests,
        total = request.result.total_tests,
        results = results,
    )
}

/// Decrements the in-flight counter however the job ends
struct InFlightTicket(Arc<AtomicUsize>);

impl InFlightTicket {
    fn issue(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fire-and-forget analysis executor
#[derive(Clone)]
pub struct AnalysisScheduler {
    model: Arc<dyn ChatModel>,
    store: Option<Arc<dyn SubmissionStore>>,
    in_flight: Arc<AtomicUsize>,
}

impl AnalysisScheduler {
    pub fn new(model: Arc<dyn ChatModel>, store: Option<Arc<dyn SubmissionStore>>) -> Self {
        Self {
            model,
            store,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start an analysis in the background and return immediately
    pub fn schedule(&self, request: AnalysisRequest) {
        let ticket = InFlightTicket::issue(&self.in_flight);
        let model = self.model.clone();
        let store = self.store.clone();
        let task = async move {
            let _ticket = ticket;
            run_analysis(model.as_ref(), store.as_deref(), request).await;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("analysis-worker".to_string())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                            Ok(runtime) => runtime.block_on(task),
                            Err(e) => warn!(error = %e, "Failed to build analysis runtime"),
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn analysis worker thread");
                }
            }
        }
    }

    /// Analyses scheduled and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no analysis is pending. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }

    /// Same as [`wait_idle`](Self::wait_idle), for callers outside a runtime
    pub fn wait_idle_blocking(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(IDLE_POLL);
        }
        true
    }
}

async fn run_analysis(model: &dyn ChatModel, store: Option<&dyn SubmissionStore>, request: AnalysisRequest) {
    let submission_id = request.submission_id.as_deref().unwrap_or("-");
    let prompt = build_prompt(&request);

    let analysis = match model.complete(&prompt, &request.params).await {
        Ok(text) => text,
        Err(e) => {
            warn!(submission_id, error = %e, "Analysis failed; dropping");
            return;
        }
    };
    info!(submission_id, chars = analysis.len(), "Analysis generated");

    let (Some(store), Some(id)) = (store, request.submission_id.as_deref()) else {
        debug!("No submission record to attach analysis to");
        return;
    };

    match store.write_analysis(id, &analysis).await {
        Ok(true) => info!(submission_id = id, "Analysis stored"),
        Ok(false) => warn!(submission_id = id, "Submission no longer exists; analysis dropped"),
        Err(e) => warn!(submission_id = id, error = %e, "Failed to store analysis"),
    }
}
