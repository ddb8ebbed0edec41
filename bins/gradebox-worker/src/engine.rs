//! Execution Engine - Abstraction for Sandboxed Execution
//!
//! **Core Responsibility:**
//! Describe an execution context and drive its lifecycle
//! (create, start, wait, logs, exec, remove) through an injected runtime.
//!
//! **Critical Architectural Boundary:**
//! - Engine knows HOW to run a container under the isolation policy
//! - Engine does NOT know test cases or expected values
//! - Engine returns raw completions and captured output
//!
//! `DockerRuntime` (docker.rs) is the production implementation; tests
//! substitute a fake that never touches a daemon.

use crate::harness::{harness_command, harness_env};
use async_trait::async_trait;
use gradebox_common::{GradingError, Language};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Label attached to every container the engine creates
pub const MANAGED_LABEL: &str = "gradebox.managed";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container engine unreachable: {0}")]
    Unreachable(String),
    #[error("image '{image}' unavailable: {message}")]
    Image { image: String, message: String },
    #[error("container operation '{operation}' failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    pub fn operation(operation: &'static str, err: impl std::fmt::Display) -> Self {
        RuntimeError::Operation {
            operation,
            message: err.to_string(),
        }
    }
}

impl From<RuntimeError> for GradingError {
    fn from(err: RuntimeError) -> Self {
        GradingError::Environment(err.to_string())
    }
}

/// Syscall filtering applied to every execution context
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SeccompPolicy {
    /// The container engine's maintained default filter
    #[default]
    EngineDefault,
    /// A custom profile, held as the JSON document the engine expects
    Profile(String),
    /// No filter at all. Only for runtime images the default filter breaks.
    Unconfined,
}

/// Resource and security ceilings for one execution context
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxPolicy {
    pub memory_limit_mb: u32,
    pub pids_limit: i64,
    pub cpu_limit: f32,
    pub timeout: Duration,
    pub tmpfs_size_mb: u32,
    pub seccomp: SeccompPolicy,
    /// Parent directory for workspaces; must be visible to the container engine
    pub workspace_root: Option<PathBuf>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            memory_limit_mb: 256,
            pids_limit: 128,
            cpu_limit: 1.0,
            timeout: Duration::from_secs(15),
            tmpfs_size_mb: 64,
            seccomp: SeccompPolicy::EngineDefault,
            workspace_root: None,
        }
    }
}

impl SandboxPolicy {
    pub fn memory_bytes(&self) -> i64 {
        self.memory_limit_mb as i64 * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }
}

/// Image, harness flavour and policy resolved for one grading call
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeProfile {
    pub image: String,
    pub language: Language,
    pub policy: SandboxPolicy,
}

/// Everything the runtime needs to create one execution context
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    /// Host directory bound read-only at the workspace mount point
    pub workspace: PathBuf,
    pub policy: SandboxPolicy,
}

impl ContainerSpec {
    /// A context that runs the harness once and exits
    pub fn harness(profile: &RuntimeProfile, workspace: &Path, function_name: &str) -> Self {
        Self {
            name: container_name(),
            image: profile.image.clone(),
            cmd: harness_command(profile.language),
            env: harness_env(function_name),
            workspace: workspace.to_path_buf(),
            policy: profile.policy.clone(),
        }
    }

    /// A context that stays alive so the harness can be exec'd repeatedly
    pub fn idle(profile: &RuntimeProfile, workspace: &Path) -> Self {
        Self {
            name: container_name(),
            image: profile.image.clone(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            env: Vec::new(),
            workspace: workspace.to_path_buf(),
            policy: profile.policy.clone(),
        }
    }
}

fn container_name() -> String {
    format!("gradebox-{}", uuid::Uuid::new_v4())
}

/// How a process inside the context ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited(i64),
    TimedOut,
}

/// Output captured from a container or exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Output ceiling per stream; anything beyond is dropped
    pub const MAX_STREAM_BYTES: usize = 1024 * 1024;

    pub fn push_stdout(&mut self, chunk: &[u8]) {
        append_capped(&mut self.stdout, chunk);
    }

    pub fn push_stderr(&mut self, chunk: &[u8]) {
        append_capped(&mut self.stderr, chunk);
    }

    /// stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

fn append_capped(buffer: &mut String, chunk: &[u8]) {
    let room = CapturedOutput::MAX_STREAM_BYTES.saturating_sub(buffer.len());
    if room == 0 {
        return;
    }
    let text = String::from_utf8_lossy(&chunk[..chunk.len().min(room)]);
    buffer.push_str(&text);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub completion: Completion,
    pub output: CapturedOutput,
}

/// Container engine client, passed in explicitly so tests can swap it
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Make the image available locally (pull on cache miss)
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a context; returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Wait for the main process, giving up after `timeout`
    async fn wait(&self, container_id: &str, timeout: Duration) -> Result<Completion, RuntimeError>;

    async fn logs(&self, container_id: &str) -> Result<CapturedOutput, RuntimeError>;

    /// Run a command inside a running context
    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        env: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, RuntimeError>;

    /// Force-remove a context (killing it if still running)
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
}

/// Container cleanup guard
///
/// `release` removes the container and is awaited on every normal path.
/// If the owning future is dropped (cancellation, panic) the guard falls
/// back to a detached removal on the current runtime.
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: Option<String>,
}

impl ContainerGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container_id: String) -> Self {
        Self {
            runtime,
            container_id: Some(container_id),
        }
    }

    pub async fn release(mut self) {
        if let Some(container_id) = self.container_id.take() {
            match self.runtime.remove(&container_id).await {
                Ok(()) => debug!(container_id = %container_id, "Container removed"),
                Err(e) => warn!(container_id = %container_id, error = %e, "Failed to remove container"),
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&container_id).await {
                        warn!(container_id = %container_id, error = %e, "Deferred container cleanup failed");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %container_id, "No runtime available; container left behind");
            }
        }
    }
}
