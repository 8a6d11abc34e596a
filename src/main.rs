use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use trawler::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "trawler")]
#[command(version, about = "Resumable pipeline orchestrator for fleet data collection")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the pipeline file. If not provided, checks pipeline.toml
    /// then pipelines/*.toml
    #[arg(long, global = true)]
    pub pipeline_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute the pipeline, resuming the most recent run by default
    Run {
        /// Start a brand-new run, ignoring existing checkpoints
        #[arg(long, conflicts_with_all = ["resume", "run_id"])]
        fresh: bool,

        /// Resume the most recent run (the default behavior)
        #[arg(long)]
        resume: bool,

        /// Force execution to begin at this step number
        #[arg(long)]
        step: Option<u32>,

        /// Resume a specific historical run id
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Show the latest run and its per-step progress
    Status,
    /// List ledger rows for every pipeline under the state directory
    List,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            2
        }
    };
    std::process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("current dir is accessible"));
    let config = Config::new(project_dir, cli.verbose, cli.pipeline_file.clone())?;
    config.ensure_directories()?;
    let _log_guard = init_tracing(&config);

    match cli.command {
        Commands::Run {
            fresh,
            resume: _,
            step,
            run_id,
        } => cmd::cmd_run(config, fresh, step, run_id).await,
        Commands::Status => {
            cmd::cmd_status(&config)?;
            Ok(0)
        }
        Commands::List => {
            cmd::cmd_list(&config)?;
            Ok(0)
        }
    }
}

/// Structured logs go to a daily-rolling file under the log directory; the
/// terminal stays free for the progress UI.
fn init_tracing(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "trawler.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if config.verbose { "debug" } else { "info" })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .init();
    guard
}
