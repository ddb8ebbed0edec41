//! Queue Consumer - the worker's main loop
//!
//! **Responsibility:**
//! Pop grading jobs, grade each one to completion, persist the outcome.
//!
//! **Shutdown:**
//! The shutdown flag is only checked between jobs. A job that has started is
//! always graded and stored, so its containers are removed by the normal
//! release path rather than left to a detached cleanup task.

use crate::executor::CodeDeployment;
use async_trait::async_trait;
use gradebox_common::error::Result;
use gradebox_common::redis;
use gradebox_common::{GradingJob, GradingOutcome};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long one pop blocks; bounds shutdown latency while idle
pub const POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of jobs and sink of outcomes
#[async_trait]
pub trait JobQueue: Send {
    /// Next job, or `None` when nothing arrived within `timeout`
    async fn pop(&mut self, timeout: Duration) -> Result<Option<GradingJob>>;

    async fn store(&mut self, outcome: &GradingOutcome) -> Result<()>;
}

/// The Redis list `gradebox:queue:grading` and its result keys
pub struct RedisJobQueue {
    conn: ::redis::aio::ConnectionManager,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = ::redis::Client::open(redis_url)?;
        let conn = ::redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn pop(&mut self, timeout: Duration) -> Result<Option<GradingJob>> {
        Ok(redis::pop_job(&mut self.conn, timeout.as_secs_f64()).await?)
    }

    async fn store(&mut self, outcome: &GradingOutcome) -> Result<()> {
        Ok(redis::store_result(&mut self.conn, outcome).await?)
    }
}

/// Grade one job into the outcome persisted for it
pub async fn grade_job(deployment: &CodeDeployment, job: &GradingJob, reuse_context: bool) -> GradingOutcome {
    let started = Instant::now();
    match deployment.grade_job(job, reuse_context).await {
        Ok(result) => {
            info!(
                job_id = %job.id,
                passed = result.passed_tests,
                total = result.total_tests,
                all_passed = result.all_passed,
                execution_ms = started.elapsed().as_millis() as u64,
                "Grading completed"
            );
            for test_result in &result.test_results {
                debug!(
                    job_id = %job.id,
                    test_id = test_result.test_id,
                    passed = test_result.passed,
                    execution_ms = test_result.execution_time.map(|d| d.as_millis() as u64),
                    "Test result"
                );
            }
            GradingOutcome {
                job_id: job.id,
                result: Some(result),
                error: None,
            }
        }
        Err(e) => {
            if e.is_environment() {
                error!(job_id = %job.id, error = %e, "Execution environment failure");
            } else {
                warn!(job_id = %job.id, error = %e, "Job rejected");
            }
            GradingOutcome {
                job_id: job.id,
                result: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Consume jobs until `shutdown` turns true
pub async fn run<Q: JobQueue>(
    queue: &mut Q,
    deployment: &CodeDeployment,
    reuse_context: bool,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let job = match queue.pop(POP_TIMEOUT).await {
            Ok(Some(job)) => job,
            // Timeout - check for shutdown
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Queue error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let queued_ms = (chrono::Utc::now() - job.queued_at).num_milliseconds();
        info!(
            job_id = %job.id,
            problem_index = job.problem_index,
            submission_id = ?job.submission_id,
            source_size = job.source_code.len(),
            queued_ms,
            "Received job"
        );

        let outcome = grade_job(deployment, &job, reuse_context).await;

        match queue.store(&outcome).await {
            Ok(()) => info!(job_id = %job.id, "Outcome persisted"),
            // Non-fatal - worker continues
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to persist outcome"),
        }
    }
    info!("Worker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeRegistry;
    use crate::engine::SandboxPolicy;
    use crate::testing::{FakeBehaviour, FakeInvocation, FakeRuntime};
    use gradebox_common::GradingError;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct MemoryQueue {
        jobs: VecDeque<GradingJob>,
        outcomes: Vec<GradingOutcome>,
        fail_store: bool,
    }

    #[async_trait]
    impl JobQueue for MemoryQueue {
        async fn pop(&mut self, _timeout: Duration) -> Result<Option<GradingJob>> {
            match self.jobs.pop_front() {
                Some(job) => Ok(Some(job)),
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(None)
                }
            }
        }

        async fn store(&mut self, outcome: &GradingOutcome) -> Result<()> {
            if self.fail_store {
                return Err(GradingError::Store("connection reset".to_string()));
            }
            self.outcomes.push(outcome.clone());
            Ok(())
        }
    }

    fn deployment(runtime: Arc<FakeRuntime>) -> CodeDeployment {
        let config = json!({
            "problems": [{
                "function_name": "add",
                "description": "Return the sum of a and b.",
                "parameter_names": ["a", "b"],
                "test_cases": [
                    {"parameters": ["2", "3"], "expected": "5"},
                    {"parameters": ["-1", "1"], "expected": "0"},
                    {"parameters": ["10", "20"], "expected": "30"}
                ]
            }]
        });
        let registry = RuntimeRegistry::new(Vec::new(), "python:3.12-slim", SandboxPolicy::default());
        CodeDeployment::from_config_value(&config, runtime, registry, None).unwrap()
    }

    fn adder() -> impl Fn(&FakeInvocation) -> FakeBehaviour + Send + Sync + 'static {
        |call| FakeBehaviour::Ok((call.int_param(0) + call.int_param(1)).to_string())
    }

    #[tokio::test]
    async fn test_shutdown_mid_job_finishes_and_stores_it() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let add = adder();
        // Shutdown arrives while the first test case is running
        let runtime = Arc::new(FakeRuntime::new(move |call| {
            shutdown_tx.send_replace(true);
            add(call)
        }));
        let deployment = deployment(runtime.clone());

        let mut queue = MemoryQueue::default();
        let first = GradingJob::new(0, "def add(a, b): return a + b");
        let second = GradingJob::new(0, "def add(a, b): return a + b");
        queue.jobs.extend([first.clone(), second.clone()]);

        run(&mut queue, &deployment, false, shutdown_rx).await;

        assert_eq!(queue.outcomes.len(), 1);
        let outcome = &queue.outcomes[0];
        assert_eq!(outcome.job_id, first.id);
        let result = outcome.result.as_ref().unwrap();
        assert!(result.all_passed);
        assert_eq!(result.total_tests, 3);

        assert_eq!(runtime.created().len(), 3);
        assert!(runtime.live_containers().is_empty());
        assert!(runtime.workspaces().iter().all(|w| !w.exists()));
        assert_eq!(queue.jobs.front().map(|j| j.id), Some(second.id));
    }

    #[tokio::test]
    async fn test_rejected_job_stores_error_outcome() {
        let runtime = Arc::new(FakeRuntime::new(adder()));
        let deployment = deployment(runtime.clone());

        let job = GradingJob::new(7, "def add(a, b): return a + b");
        let outcome = grade_job(&deployment, &job, false).await;

        assert_eq!(outcome.job_id, job.id);
        assert!(outcome.result.is_none());
        assert!(outcome.error.unwrap().contains("out of range"));
        assert!(runtime.created().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_stop_the_loop() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = Arc::new(FakeRuntime::new(adder()));
        let deployment = deployment(runtime.clone());

        let mut queue = MemoryQueue {
            fail_store: true,
            ..MemoryQueue::default()
        };
        queue.jobs.extend([
            GradingJob::new(0, "def add(a, b): return a + b"),
            GradingJob::new(0, "def add(a, b): return a + b"),
        ]);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown_tx.send(true).unwrap();
        });
        run(&mut queue, &deployment, true, shutdown_rx).await;
        stopper.await.unwrap();

        assert!(queue.jobs.is_empty());
        // Reused context: one container per job
        assert_eq!(runtime.created().len(), 2);
        assert!(runtime.live_containers().is_empty());
    }
}
