// CLI commands for operating a gradebox deployment locally
use anyhow::{bail, Context, Result};
use gradebox_common::catalog;
use gradebox_common::redis;
use gradebox_common::store::MemorySubmissionStore;
use gradebox_common::{AggregateRunResult, Config, GradingJob, ProblemConfiguration, SubmissionStore};
use gradebox_worker::{AnalysisScheduler, CodeDeployment, DockerRuntime, OpenAiChatModel, RuntimeRegistry};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// How long `grade` waits for the background analysis before giving up
const ANALYSIS_WAIT: Duration = Duration::from_secs(120);

/// Options for the `grade` command
pub struct GradeOptions<'a> {
    pub config_path: &'a Path,
    pub problem_index: usize,
    pub code_path: &'a Path,
    pub image: Option<&'a str>,
    pub reuse_context: bool,
    pub submission_id: Option<&'a str>,
    pub runtimes_path: Option<&'a Path>,
}

fn problem_row(problem: &ProblemConfiguration) -> String {
    let analysis = match (&problem.analysis_model_params, problem.analyze_on_success) {
        (Some(params), true) => format!("{} (always)", params.model),
        (Some(params), false) => format!("{} (on failure)", params.model),
        (None, _) => "off".to_string(),
    };
    format!(
        "{:<6} {:<36} {:<7} {}",
        problem.problem_index,
        problem.signature(),
        problem.test_cases.len(),
        analysis
    )
}

/// List the problems of a deployment configuration
pub fn list_problems(config_path: &Path) -> Result<()> {
    let problems = catalog::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    println!("📋 Problems in {}:\n", config_path.display());
    println!("{:<6} {:<36} {:<7} {}", "INDEX", "FUNCTION", "TESTS", "ANALYSIS");
    println!("{}", "─".repeat(80));

    for problem in &problems {
        println!("{}", problem_row(problem));
        if !problem.description.is_empty() {
            println!("       {}", problem.description.lines().next().unwrap_or_default());
        }
    }

    println!("\n✅ Total: {} problem(s)", problems.len());
    Ok(())
}

/// List runtime images known to the registry
pub fn list_runtimes(runtimes_path: Option<&Path>) -> Result<()> {
    let mut config = Config::from_env().context("Invalid environment configuration")?;
    if let Some(path) = runtimes_path {
        config.runtimes_config = path.to_path_buf();
    }
    let registry = RuntimeRegistry::from_config(&config)?;

    let names = registry.list_runtimes();
    if names.is_empty() {
        println!("No runtimes configured.");
        println!("\n💡 Every image runs with the Python harness; default: {}", registry.default_image());
        return Ok(());
    }

    println!("📋 Configured Runtimes:\n");
    println!("{:<12} {:<30} {:<12} {:<10} {:<6}", "NAME", "IMAGE", "LANGUAGE", "MEMORY", "CPU");
    println!("{}", "─".repeat(80));
    for name in &names {
        let profile = registry.resolve(Some(name));
        println!(
            "{:<12} {:<30} {:<12} {:<10} {:.1}",
            name,
            profile.image,
            profile.language,
            format!("{} MB", profile.policy.memory_limit_mb),
            profile.policy.cpu_limit
        );
    }
    println!("\n✅ Default image: {}", registry.default_image());
    Ok(())
}

fn read_code(code_path: &Path) -> Result<String> {
    let code = fs::read_to_string(code_path)
        .with_context(|| format!("Failed to read {}", code_path.display()))?;
    if code.trim().is_empty() {
        bail!("{} is empty", code_path.display());
    }
    Ok(code)
}

fn print_summary(result: &AggregateRunResult) {
    for test in &result.test_results {
        let mark = if test.passed { "✓" } else { "✗" };
        let actual = test
            .actual_output
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        eprintln!(
            "  {} Test {}: expected {}, got {}",
            mark, test.test_id, test.expected_output, actual
        );
        if let Some(error) = &test.error {
            eprintln!("      {}", error.lines().last().unwrap_or_default());
        }
    }
    eprintln!(
        "\n{} {} of {} test(s) passed",
        if result.all_passed { "✅" } else { "❌" },
        result.passed_tests,
        result.total_tests
    );
}

/// Grade a source file against one problem and print the JSON verdict
pub async fn grade(options: GradeOptions<'_>) -> Result<()> {
    let mut config = Config::from_env().context("Invalid environment configuration")?;
    if let Some(path) = options.runtimes_path {
        config.runtimes_config = path.to_path_buf();
    }

    let code = read_code(options.code_path)?;
    debug!(
        image = ?options.image,
        reuse_context = options.reuse_context,
        code_bytes = code.len(),
        "Grade options"
    );
    let registry = RuntimeRegistry::from_config(&config)?;
    let runtime = DockerRuntime::connect().await.context("Docker is not reachable")?;

    // Analysis output is kept in memory and printed once it lands
    let store = Arc::new(MemorySubmissionStore::new());
    let submission_id = options.submission_id.unwrap_or("local");
    store.insert(submission_id);
    let model = OpenAiChatModel::from_config(&config).context("Failed to build analysis client")?;
    let store_handle: Arc<dyn SubmissionStore> = store.clone();
    let scheduler = AnalysisScheduler::new(Arc::new(model), Some(store_handle));

    let deployment = CodeDeployment::load(options.config_path, Arc::new(runtime), registry, Some(scheduler.clone()))
        .with_context(|| format!("Failed to load {}", options.config_path.display()))?;
    let problem = deployment.problem(options.problem_index)?;
    eprintln!("🚀 Grading {} against {}", options.code_path.display(), problem.signature());

    let result = if options.reuse_context {
        let context = deployment
            .open_context(&code, options.problem_index, options.image)
            .await?;
        let result = deployment
            .run_all_tests_in_context(&context, options.problem_index, Some(submission_id))
            .await;
        context.close().await;
        result?
    } else {
        deployment
            .run_all_tests(&code, options.problem_index, options.image, Some(submission_id))
            .await?
    };

    print_summary(&result);
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );

    if scheduler.in_flight() > 0 {
        eprintln!("\n⏳ Waiting for analysis...");
        if !scheduler.wait_idle(ANALYSIS_WAIT).await {
            eprintln!("⚠️  Analysis did not finish within {}s", ANALYSIS_WAIT.as_secs());
            return Ok(());
        }
        match store.analysis(submission_id) {
            Some(analysis) => eprintln!("\n📝 Analysis:\n{}", analysis),
            None => eprintln!("⚠️  Analysis failed; run with RUST_LOG=debug for details"),
        }
    }

    Ok(())
}

/// Options for the `submit` command
pub struct SubmitOptions<'a> {
    pub problem_index: usize,
    pub code_path: &'a Path,
    pub image: Option<&'a str>,
    pub submission_id: Option<&'a str>,
}

fn build_job(code: String, options: &SubmitOptions<'_>) -> GradingJob {
    let mut job = GradingJob::new(options.problem_index, code);
    job.runtime_image = options.image.map(str::to_string);
    job.submission_id = options.submission_id.map(str::to_string);
    job
}

async fn connect_redis(config: &Config) -> Result<::redis::aio::ConnectionManager> {
    let client = ::redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

/// Queue a source file for a running worker
pub async fn submit(options: SubmitOptions<'_>) -> Result<()> {
    let config = Config::from_env().context("Invalid environment configuration")?;
    let job = build_job(read_code(options.code_path)?, &options);

    let mut conn = connect_redis(&config).await?;
    redis::push_job(&mut conn, &job).await.context("Failed to queue job")?;

    eprintln!("✅ Queued {} for problem {}", options.code_path.display(), job.problem_index);
    println!("{}", job.id);
    Ok(())
}

fn parse_job_id(job_id: &str) -> Result<Uuid> {
    Uuid::parse_str(job_id.trim()).with_context(|| format!("Invalid job id '{}'", job_id))
}

/// Print the stored outcome of a queued job
pub async fn result(job_id: &str) -> Result<()> {
    let config = Config::from_env().context("Invalid environment configuration")?;
    let job_id = parse_job_id(job_id)?;

    let mut conn = connect_redis(&config).await?;
    match redis::get_result(&mut conn, &job_id).await.context("Failed to query job result")? {
        Some(outcome) => {
            if let Some(result) = &outcome.result {
                print_summary(result);
            }
            if let Some(error) = &outcome.error {
                eprintln!("❌ {}", error);
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
            );
        }
        None => eprintln!("⏳ Job {} is queued or still running", job_id),
    }
    Ok(())
}
