//! Sandbox Runner - one test case, one harness run
//!
//! Two strategies share the `TestRunner` contract:
//!
//! - `IsolatedRunner` (default): a fresh workspace and a fresh container for
//!   every test case. The container is removed and the workspace deleted
//!   before `run_one` returns, on every path.
//! - `SandboxContext`: one long-running container per submission. Each test
//!   rewrites `params.json` and execs the harness again. Execs are serialized.
//!   Only used when a caller opens the context explicitly.

use crate::engine::{
    CapturedOutput, Completion, ContainerGuard, ContainerRuntime, ContainerSpec, RuntimeProfile,
};
use crate::evaluator::evaluate_test;
use crate::harness::{harness_command, harness_env, Workspace};
use async_trait::async_trait;
use gradebox_common::error::Result;
use gradebox_common::{GradingError, TestCase, TestExecutionResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Largest accepted submission
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;
/// Largest accepted serialized parameter list for one test case
pub const MAX_PARAMS_BYTES: usize = 10 * 1024 * 1024;

/// Runs a single test case of one submission
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_one(&self, test_case: &TestCase) -> Result<TestExecutionResult>;
}

fn check_source(code: &str) -> Result<()> {
    if code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(GradingError::config(format!(
            "source code is {} bytes, limit is {}",
            code.len(),
            MAX_SOURCE_CODE_BYTES
        )));
    }
    Ok(())
}

fn check_parameters(test_case: &TestCase) -> Result<()> {
    let size = serde_json::to_vec(&test_case.parameters)
        .map_err(|e| GradingError::config(format!("test {}: unserializable parameters: {}", test_case.id, e)))?
        .len();
    if size > MAX_PARAMS_BYTES {
        return Err(GradingError::config(format!(
            "test {}: parameters are {} bytes, limit is {}",
            test_case.id, size, MAX_PARAMS_BYTES
        )));
    }
    Ok(())
}

/// Verify the engine answers and the image is present
async fn prepare_runtime(runtime: &dyn ContainerRuntime, profile: &RuntimeProfile) -> Result<()> {
    runtime.ping().await?;
    runtime.ensure_image(&profile.image).await?;
    Ok(())
}

/// Fresh container per test case
pub struct IsolatedRunner {
    runtime: Arc<dyn ContainerRuntime>,
    profile: RuntimeProfile,
    code: String,
    function_name: String,
}

impl IsolatedRunner {
    pub async fn prepare(
        runtime: Arc<dyn ContainerRuntime>,
        profile: RuntimeProfile,
        code: &str,
        function_name: &str,
    ) -> Result<Self> {
        check_source(code)?;
        prepare_runtime(runtime.as_ref(), &profile).await?;
        Ok(Self {
            runtime,
            profile,
            code: code.to_string(),
            function_name: function_name.to_string(),
        })
    }

    async fn run_in_workspace(&self, workspace: &Workspace, test_case: &TestCase) -> Result<TestExecutionResult> {
        workspace.write_params(&test_case.parameters)?;

        let spec = ContainerSpec::harness(&self.profile, workspace.path(), &self.function_name);
        let container_id = self.runtime.create(&spec).await?;
        let guard = ContainerGuard::new(self.runtime.clone(), container_id.clone());
        debug!(container_id = %container_id, test_id = test_case.id, "Container created");

        let outcome = self.execute(&container_id, test_case).await;
        guard.release().await;
        outcome
    }

    async fn execute(&self, container_id: &str, test_case: &TestCase) -> Result<TestExecutionResult> {
        let timeout = self.profile.policy.timeout;
        let started = Instant::now();

        self.runtime.start(container_id).await?;
        let completion = self.runtime.wait(container_id, timeout).await?;
        let elapsed = started.elapsed();

        let output = match completion {
            Completion::TimedOut => {
                warn!(test_id = test_case.id, timeout_ms = timeout.as_millis() as u64, "Execution timed out");
                CapturedOutput::default()
            }
            Completion::Exited(_) => self.runtime.logs(container_id).await?,
        };

        debug!(
            test_id = test_case.id,
            execution_ms = elapsed.as_millis() as u64,
            "Test executed"
        );
        Ok(evaluate_test(test_case, completion, &output, elapsed, timeout))
    }
}

#[async_trait]
impl TestRunner for IsolatedRunner {
    async fn run_one(&self, test_case: &TestCase) -> Result<TestExecutionResult> {
        check_parameters(test_case)?;

        let workspace = Workspace::create(
            self.profile.language,
            &self.code,
            self.profile.policy.workspace_root.as_deref(),
        )?;
        let result = self.run_in_workspace(&workspace, test_case).await;

        if let Err(e) = workspace.close() {
            warn!(test_id = test_case.id, error = %e, "Failed to delete workspace");
        }
        result
    }
}

/// A live execution context reused for every test case of one submission
pub struct SandboxContext {
    runtime: Arc<dyn ContainerRuntime>,
    profile: RuntimeProfile,
    code: String,
    function_name: String,
    workspace: Workspace,
    container_id: String,
    guard: ContainerGuard,
    exec_lock: Mutex<()>,
}

impl SandboxContext {
    /// Create and start the context with the submission mounted
    pub async fn open(
        runtime: Arc<dyn ContainerRuntime>,
        profile: RuntimeProfile,
        code: &str,
        function_name: &str,
    ) -> Result<Self> {
        check_source(code)?;
        prepare_runtime(runtime.as_ref(), &profile).await?;

        let workspace = Workspace::create(profile.language, code, profile.policy.workspace_root.as_deref())?;
        let spec = ContainerSpec::idle(&profile, workspace.path());

        let container_id = match runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                discard_workspace(workspace);
                return Err(e.into());
            }
        };
        let guard = ContainerGuard::new(runtime.clone(), container_id.clone());

        if let Err(e) = runtime.start(&container_id).await {
            guard.release().await;
            discard_workspace(workspace);
            return Err(e.into());
        }

        info!(container_id = %container_id, image = %profile.image, "Sandbox context opened");
        Ok(Self {
            runtime,
            profile,
            code: code.to_string(),
            function_name: function_name.to_string(),
            workspace,
            container_id,
            guard,
            exec_lock: Mutex::new(()),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Remove the container and delete the workspace
    pub async fn close(self) {
        self.guard.release().await;
        discard_workspace(self.workspace);
        info!(container_id = %self.container_id, "Sandbox context closed");
    }
}

fn discard_workspace(workspace: Workspace) {
    if let Err(e) = workspace.close() {
        warn!(error = %e, "Failed to delete workspace");
    }
}

#[async_trait]
impl TestRunner for SandboxContext {
    async fn run_one(&self, test_case: &TestCase) -> Result<TestExecutionResult> {
        check_parameters(test_case)?;
        let _exec = self.exec_lock.lock().await;

        self.workspace.write_params(&test_case.parameters)?;

        let timeout = self.profile.policy.timeout;
        let started = Instant::now();
        let outcome = self
            .runtime
            .exec(
                &self.container_id,
                &harness_command(self.profile.language),
                &harness_env(&self.function_name),
                timeout,
            )
            .await?;
        let elapsed = started.elapsed();

        if outcome.completion == Completion::TimedOut {
            warn!(
                container_id = %self.container_id,
                test_id = test_case.id,
                timeout_ms = timeout.as_millis() as u64,
                "Exec timed out"
            );
        }
        Ok(evaluate_test(test_case, outcome.completion, &outcome.output, elapsed, timeout))
    }
}
