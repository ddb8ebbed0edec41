use anyhow::Context;
use gradebox_common::redis;
use gradebox_common::redis::RedisSubmissionStore;
use gradebox_common::{Config, SubmissionStore};
use gradebox_worker::worker;
use gradebox_worker::{AnalysisScheduler, CodeDeployment, DockerRuntime, OpenAiChatModel, RedisJobQueue, RuntimeRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long shutdown waits for pending analyses
const ANALYSIS_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Gradebox Worker booting...");

    let config = Config::from_env().context("Invalid environment configuration")?;

    let registry = RuntimeRegistry::from_config(&config).map_err(|e| {
        error!("Failed to load runtime configuration: {:#}", e);
        e
    })?;
    info!(
        default_image = %registry.default_image(),
        runtimes = ?registry.list_runtimes(),
        timeout_ms = config.timeout_ms,
        memory_mb = config.memory_limit_mb,
        "Runtime registry loaded"
    );

    // The engine must be reachable before any job is taken
    let runtime = DockerRuntime::connect()
        .await
        .context("Docker is not reachable")?;
    info!("Connected to Docker");

    let store: Arc<dyn SubmissionStore> = Arc::new(RedisSubmissionStore::open(&config.redis_url)?);
    let model = OpenAiChatModel::from_config(&config).context("Failed to build analysis client")?;
    if config.analysis_api_key.is_none() {
        warn!("No analysis API key configured; analysis requests will be unauthenticated");
    }
    let scheduler = AnalysisScheduler::new(Arc::new(model), Some(store));

    let deployment = CodeDeployment::load(
        &config.deployment_config,
        Arc::new(runtime),
        registry,
        Some(scheduler.clone()),
    )
    .with_context(|| format!("Failed to load deployment {}", config.deployment_config.display()))?;

    for problem in deployment.problems() {
        info!(
            problem_index = problem.problem_index,
            function = %problem.signature(),
            tests = problem.test_cases.len(),
            analysis = problem.analysis_enabled,
            "Problem loaded"
        );
    }

    let mut queue = RedisJobQueue::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;

    info!("Connected to Redis: {}", config.redis_url);
    info!(queue = redis::QUEUE_KEY, reuse_context = config.reuse_context, "Waiting for jobs");

    // Setup graceful shutdown: the job in progress finishes first
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received shutdown signal, finishing current job...");
                shutdown_tx.send_replace(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    worker::run(&mut queue, &deployment, config.reuse_context, shutdown_rx).await;

    if !scheduler.wait_idle(ANALYSIS_DRAIN_TIMEOUT).await {
        warn!(pending = scheduler.in_flight(), "Shutting down with analyses still running");
    }

    info!("Worker shutdown complete");
    Ok(())
}
