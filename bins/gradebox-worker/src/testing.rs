//! In-process doubles for the container runtime and the chat model.
//!
//! `FakeRuntime` never starts a process: when a harness runs it reads the
//! solution and `params.json` from the bound workspace and hands them to a
//! closure that decides what the "process" printed.

use crate::analysis::{AnalysisError, ChatModel};
use crate::engine::{
    CapturedOutput, Completion, ContainerRuntime, ContainerSpec, ExecOutcome, RuntimeError,
};
use crate::harness::{FUNCTION_ENV, PARAMS_FILE};
use async_trait::async_trait;
use gradebox_common::{AnalysisModelParams, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the harness saw for one run
#[derive(Debug, Clone, PartialEq)]
pub struct FakeInvocation {
    pub function: String,
    pub code: String,
    pub params: Vec<Value>,
}

impl FakeInvocation {
    pub fn int_param(&self, index: usize) -> i64 {
        match self.params.get(index) {
            Some(Value::Int(n)) => *n,
            _ => 0,
        }
    }
}

/// What the harness "did"
#[derive(Debug, Clone)]
pub enum FakeBehaviour {
    /// Printed this value and exited 0
    Ok(String),
    Fail { code: i64, stderr: String },
    /// Never finishes
    Hang,
}

type Behaviour = dyn Fn(&FakeInvocation) -> FakeBehaviour + Send + Sync;

#[derive(Default)]
struct State {
    specs: HashMap<String, ContainerSpec>,
    created: Vec<String>,
    removed: HashSet<String>,
    workspaces: Vec<PathBuf>,
    calls: Vec<FakeInvocation>,
    outcomes: HashMap<String, FakeBehaviour>,
}

pub struct FakeRuntime {
    behaviour: Box<Behaviour>,
    state: Mutex<State>,
    unreachable: AtomicBool,
    fail_start: AtomicBool,
}

impl FakeRuntime {
    pub fn new(behaviour: impl Fn(&FakeInvocation) -> FakeBehaviour + Send + Sync + 'static) -> Self {
        Self {
            behaviour: Box::new(behaviour),
            state: Mutex::new(State::default()),
            unreachable: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<FakeInvocation> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().workspaces.clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        let state = self.state.lock().unwrap();
        state.created.iter().filter_map(|id| state.specs.get(id).cloned()).collect()
    }

    /// Containers created and not yet removed
    pub fn live_containers(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .created
            .iter()
            .filter(|id| !state.removed.contains(*id))
            .cloned()
            .collect()
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    fn invoke(&self, workspace: &Path, env: &[String]) -> FakeBehaviour {
        let function = env
            .iter()
            .find_map(|e| e.strip_prefix(&format!("{}=", FUNCTION_ENV)))
            .unwrap_or_default()
            .to_string();
        let code = ["solution.py", "solution.js"]
            .iter()
            .find_map(|name| fs::read_to_string(workspace.join(name)).ok())
            .unwrap_or_default();
        let params: Vec<Value> = fs::read_to_string(workspace.join(PARAMS_FILE))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let call = FakeInvocation { function, code, params };
        let outcome = (self.behaviour)(&call);
        self.state.lock().unwrap().calls.push(call);
        outcome
    }
}

fn captured(behaviour: &FakeBehaviour) -> CapturedOutput {
    match behaviour {
        FakeBehaviour::Ok(stdout) => CapturedOutput {
            stdout: format!("\n{}\n", stdout),
            stderr: String::new(),
        },
        FakeBehaviour::Fail { stderr, .. } => CapturedOutput {
            stdout: String::new(),
            stderr: stderr.clone(),
        },
        FakeBehaviour::Hang => CapturedOutput::default(),
    }
}

async fn complete(behaviour: &FakeBehaviour, timeout: Duration) -> Completion {
    match behaviour {
        FakeBehaviour::Ok(_) => Completion::Exited(0),
        FakeBehaviour::Fail { code, .. } => Completion::Exited(*code),
        FakeBehaviour::Hang => {
            tokio::time::sleep(timeout).await;
            Completion::TimedOut
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_reachable()
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.check_reachable()
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_reachable()?;
        let id = format!("fake-{}", spec.name);
        let mut state = self.state.lock().unwrap();
        state.created.push(id.clone());
        state.workspaces.push(spec.workspace.clone());
        state.specs.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::operation("start", "daemon rejected the request"));
        }
        let spec = self
            .state
            .lock()
            .unwrap()
            .specs
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::operation("start", "no such container"))?;

        // Idle contexts run nothing until exec
        if spec.cmd.first().map(String::as_str) != Some("sleep") {
            let outcome = self.invoke(&spec.workspace, &spec.env);
            self.state.lock().unwrap().outcomes.insert(container_id.to_string(), outcome);
        }
        Ok(())
    }

    async fn wait(&self, container_id: &str, timeout: Duration) -> Result<Completion, RuntimeError> {
        let outcome = self
            .state
            .lock()
            .unwrap()
            .outcomes
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::operation("wait", "container not started"))?;
        Ok(complete(&outcome, timeout).await)
    }

    async fn logs(&self, container_id: &str) -> Result<CapturedOutput, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state.outcomes.get(container_id).map(captured).unwrap_or_default())
    }

    async fn exec(
        &self,
        container_id: &str,
        _cmd: &[String],
        env: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, RuntimeError> {
        self.check_reachable()?;
        let workspace = self
            .state
            .lock()
            .unwrap()
            .specs
            .get(container_id)
            .map(|spec| spec.workspace.clone())
            .ok_or_else(|| RuntimeError::operation("create_exec", "no such container"))?;

        let outcome = self.invoke(&workspace, env);
        let completion = complete(&outcome, timeout).await;
        Ok(ExecOutcome {
            completion,
            output: captured(&outcome),
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().removed.insert(container_id.to_string());
        Ok(())
    }
}

/// Chat model double that records every prompt
pub struct FakeChatModel {
    reply: Result<String, String>,
    delay: Duration,
    prompts: Mutex<Vec<(String, AnalysisModelParams)>>,
}

impl FakeChatModel {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn prompts(&self) -> Vec<(String, AnalysisModelParams)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn complete(&self, prompt: &str, params: &AnalysisModelParams) -> Result<String, AnalysisError> {
        self.prompts.lock().unwrap().push((prompt.to_string(), params.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone().map_err(|message| AnalysisError::Api {
            status: 500,
            body: message,
        })
    }
}
