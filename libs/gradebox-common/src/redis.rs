use crate::error::{GradingError, Result};
use crate::store::SubmissionStore;
use crate::types::{GradingJob, GradingOutcome};
use async_trait::async_trait;
use redis::{AsyncCommands, RedisResult};
use tracing::debug;

/// Redis key layout shared by producers and the worker.
/// Keys are deterministic so every side computes the same names.

pub const QUEUE_KEY: &str = "gradebox:queue:grading";
pub const RESULT_PREFIX: &str = "gradebox:result";
pub const SUBMISSION_PREFIX: &str = "gradebox:submission";

/// Results expire after 24 hours
pub const RESULT_TTL_SECONDS: u64 = 86_400;

/// Sets `analysis` only on a submission hash that already exists
const WRITE_ANALYSIS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], 'analysis', ARGV[1])
  return 1
end
return 0
"#;

/// Generate result key for a job
pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// Generate the hash key of a submission record
pub fn submission_key(submission_id: &str) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, submission_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a grading job (RPUSH for FIFO semantics)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradingJob,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop a grading job
/// Uses BLPOP with timeout for graceful shutdown
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<GradingJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: GradingJob = serde_json::from_str(&payload).map_err(serialization_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a grading outcome with TTL
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    outcome: &GradingOutcome,
) -> RedisResult<()> {
    let payload = serde_json::to_string(outcome).map_err(serialization_error)?;
    conn.set_ex(result_key(&outcome.job_id), payload, RESULT_TTL_SECONDS as _).await
}

/// Retrieve a grading outcome
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<GradingOutcome>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data).map_err(serialization_error)?)),
        None => Ok(None),
    }
}

/// Submission store backed by Redis hashes.
///
/// Holds a client, not a connection: every write opens its own connection,
/// so a background task never shares a handle tied to a request.
#[derive(Clone)]
pub struct RedisSubmissionStore {
    client: redis::Client,
}

impl RedisSubmissionStore {
    pub fn open(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GradingError::config(format!("invalid redis url '{}': {}", redis_url, e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SubmissionStore for RedisSubmissionStore {
    async fn write_analysis(&self, submission_id: &str, analysis: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let written: i64 = redis::Script::new(WRITE_ANALYSIS_SCRIPT)
            .key(submission_key(submission_id))
            .arg(analysis)
            .invoke_async(&mut conn)
            .await?;
        debug!(submission_id, written, "Analysis write attempted");
        Ok(written == 1)
    }
}
