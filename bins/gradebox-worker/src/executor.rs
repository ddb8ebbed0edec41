//! Grading Executor - High-Level Orchestration
//!
//! **Responsibility:**
//! Select a problem, run every test case through a `TestRunner`, aggregate
//! the verdict and hand off analysis to the scheduler.
//!
//! **Architecture:**
//! 1. Resolve the runtime image into a profile (config.rs)
//! 2. Run each test case in a sandbox (runner.rs)
//! 3. Aggregate with the evaluator (evaluator.rs)
//! 4. Fire the analysis scheduler when warranted (analysis.rs)
//!
//! This module is the glue layer - it knows nothing about:
//! - How code executes (runner's job)
//! - How outputs compare (evaluator's job)

use crate::analysis::{AnalysisRequest, AnalysisScheduler};
use crate::config::RuntimeRegistry;
use crate::engine::ContainerRuntime;
use crate::evaluator::{aggregate, should_analyze};
use crate::runner::{IsolatedRunner, SandboxContext, TestRunner};
use gradebox_common::catalog;
use gradebox_common::error::Result;
use gradebox_common::{AggregateRunResult, GradingError, GradingJob, ProblemConfiguration};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A deployed set of code problems and the machinery to grade them
pub struct CodeDeployment {
    problems: Vec<ProblemConfiguration>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: RuntimeRegistry,
    scheduler: Option<AnalysisScheduler>,
}

impl CodeDeployment {
    pub fn new(
        problems: Vec<ProblemConfiguration>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: RuntimeRegistry,
        scheduler: Option<AnalysisScheduler>,
    ) -> Result<Self> {
        if problems.is_empty() {
            return Err(GradingError::config("deployment has no problems"));
        }
        Ok(Self {
            problems,
            runtime,
            registry,
            scheduler,
        })
    }

    /// Build from a raw deployment configuration
    pub fn from_config_value(
        raw: &serde_json::Value,
        runtime: Arc<dyn ContainerRuntime>,
        registry: RuntimeRegistry,
        scheduler: Option<AnalysisScheduler>,
    ) -> Result<Self> {
        Self::new(catalog::parse(raw)?, runtime, registry, scheduler)
    }

    /// Build from a deployment configuration file
    pub fn load(
        path: &Path,
        runtime: Arc<dyn ContainerRuntime>,
        registry: RuntimeRegistry,
        scheduler: Option<AnalysisScheduler>,
    ) -> Result<Self> {
        Self::new(catalog::load(path)?, runtime, registry, scheduler)
    }

    pub fn problems(&self) -> &[ProblemConfiguration] {
        &self.problems
    }

    pub fn problem(&self, problem_index: usize) -> Result<&ProblemConfiguration> {
        self.problems
            .get(problem_index)
            .ok_or(GradingError::ProblemNotFound {
                index: problem_index,
                available: self.problems.len(),
            })
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> Option<&AnalysisScheduler> {
        self.scheduler.as_ref()
    }

    /// Grade a submission, one fresh container per test case
    #[instrument(skip(self, code), fields(code_bytes = code.len()))]
    pub async fn run_all_tests(
        &self,
        code: &str,
        problem_index: usize,
        runtime_image: Option<&str>,
        submission_id: Option<&str>,
    ) -> Result<AggregateRunResult> {
        let problem = self.problem(problem_index)?;
        let profile = self.registry.resolve(runtime_image);
        info!(image = %profile.image, tests = problem.test_cases.len(), "Grading submission");

        let runner = IsolatedRunner::prepare(self.runtime.clone(), profile, code, &problem.function_name).await?;
        self.grade(&runner, problem, code, submission_id).await
    }

    /// Open a reusable context for one submission to a problem
    pub async fn open_context(
        &self,
        code: &str,
        problem_index: usize,
        runtime_image: Option<&str>,
    ) -> Result<SandboxContext> {
        let problem = self.problem(problem_index)?;
        let profile = self.registry.resolve(runtime_image);
        SandboxContext::open(self.runtime.clone(), profile, code, &problem.function_name).await
    }

    /// Grade the submission held by an open context
    #[instrument(skip(self, context), fields(container_id = %context.container_id()))]
    pub async fn run_all_tests_in_context(
        &self,
        context: &SandboxContext,
        problem_index: usize,
        submission_id: Option<&str>,
    ) -> Result<AggregateRunResult> {
        let problem = self.problem(problem_index)?;
        if context.function_name() != problem.function_name {
            return Err(GradingError::config(format!(
                "context was opened for '{}', problem {} expects '{}'",
                context.function_name(),
                problem_index,
                problem.function_name
            )));
        }
        info!(tests = problem.test_cases.len(), "Grading submission in reused context");

        self.grade(context, problem, context.code(), submission_id).await
    }

    /// Grade a queued job, closing any context it opened
    pub async fn grade_job(&self, job: &GradingJob, reuse_context: bool) -> Result<AggregateRunResult> {
        let image = job.runtime_image.as_deref();
        let submission_id = job.submission_id.as_deref();

        if !reuse_context {
            return self
                .run_all_tests(&job.source_code, job.problem_index, image, submission_id)
                .await;
        }

        let context = self.open_context(&job.source_code, job.problem_index, image).await?;
        let result = self
            .run_all_tests_in_context(&context, job.problem_index, submission_id)
            .await;
        context.close().await;
        result
    }

    async fn grade(
        &self,
        runner: &dyn TestRunner,
        problem: &ProblemConfiguration,
        code: &str,
        submission_id: Option<&str>,
    ) -> Result<AggregateRunResult> {
        let mut results = Vec::with_capacity(problem.test_cases.len());
        for test_case in &problem.test_cases {
            results.push(runner.run_one(test_case).await?);
        }

        let result = aggregate(problem.problem_index, results);

        if should_analyze(problem, result.all_passed) {
            match (&self.scheduler, AnalysisRequest::new(problem, code, &result, submission_id)) {
                (Some(scheduler), Some(request)) => {
                    debug!(submission_id = ?submission_id, "Scheduling analysis");
                    scheduler.schedule(request);
                }
                _ => debug!("Analysis warranted but no scheduler configured"),
            }
        }

        Ok(result)
    }
}
