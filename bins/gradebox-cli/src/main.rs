mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gradebox")]
#[command(about = "Gradebox CLI - Inspect deployments and grade submissions locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the problems of a deployment configuration
    Problems {
        /// Deployment configuration file
        #[arg(short, long, default_value = "config/deployment.json")]
        config: PathBuf,
    },

    /// List configured runtime images
    Runtimes {
        /// Runtime registry file (defaults to RUNTIMES_CONFIG or config/runtimes.json)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Grade a source file against one problem
    Grade {
        /// Deployment configuration file
        #[arg(short, long, default_value = "config/deployment.json")]
        config: PathBuf,

        /// Problem index (0-based)
        #[arg(short, long, default_value = "0")]
        problem: usize,

        /// Source file to grade
        #[arg(long)]
        code: PathBuf,

        /// Runtime image or runtime name (defaults to DEFAULT_RUNTIME_IMAGE)
        #[arg(short, long)]
        image: Option<String>,

        /// Run every test case in one reused execution context
        #[arg(long, default_value = "false")]
        reuse_context: bool,

        /// Submission id the analysis is attached to
        #[arg(short, long)]
        submission_id: Option<String>,

        /// Runtime registry file
        #[arg(long)]
        runtimes: Option<PathBuf>,
    },

    /// Queue a source file for a running worker
    Submit {
        /// Problem index (0-based)
        #[arg(short, long, default_value = "0")]
        problem: usize,

        /// Source file to grade
        #[arg(long)]
        code: PathBuf,

        /// Runtime image or runtime name
        #[arg(short, long)]
        image: Option<String>,

        /// Submission id the analysis is attached to
        #[arg(short, long)]
        submission_id: Option<String>,
    },

    /// Show the stored outcome of a queued job
    Result {
        /// Job id printed by `submit`
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Problems { config } => {
            commands::list_problems(&config)?;
        }
        Commands::Runtimes { file } => {
            commands::list_runtimes(file.as_deref())?;
        }
        Commands::Grade {
            config,
            problem,
            code,
            image,
            reuse_context,
            submission_id,
            runtimes,
        } => {
            commands::grade(commands::GradeOptions {
                config_path: &config,
                problem_index: problem,
                code_path: &code,
                image: image.as_deref(),
                reuse_context,
                submission_id: submission_id.as_deref(),
                runtimes_path: runtimes.as_deref(),
            })
            .await?;
        }
        Commands::Submit {
            problem,
            code,
            image,
            submission_id,
        } => {
            commands::submit(commands::SubmitOptions {
                problem_index: problem,
                code_path: &code,
                image: image.as_deref(),
                submission_id: submission_id.as_deref(),
            })
            .await?;
        }
        Commands::Result { job_id } => {
            commands::result(&job_id).await?;
        }
    }

    Ok(())
}
