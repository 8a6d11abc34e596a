//! Pipeline execution — `trawler run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use trawler::checkpoint::{CheckpointStore, FileCheckpointStore};
use trawler::config::Config;
use trawler::handlers::build_pipeline;
use trawler::orchestrator::{Orchestrator, RunOptions, StartMode};
use trawler::pipeline::PipelineFile;
use trawler::session::{NullSessionFactory, ProcessSessionFactory, SessionFactory};
use trawler::ui::TrawlerUI;

/// Exit code for a run interrupted by the stop signal; it stays resumable.
const EXIT_INTERRUPTED: i32 = 130;

pub async fn cmd_run(
    mut config: Config,
    fresh: bool,
    step: Option<u32>,
    run_id: Option<String>,
) -> Result<i32> {
    let file = PipelineFile::load(&config.pipeline_file)?;
    config.limits.apply(&file.limits);

    let pipeline = build_pipeline(&file, &config.project_dir);
    let store = Arc::new(
        FileCheckpointStore::open(&config.state_dir, &pipeline.name)
            .context("Failed to open checkpoint store")?,
    );

    let factory: Arc<dyn SessionFactory> = match &file.session {
        Some(session) => Arc::new(ProcessSessionFactory::new(
            &session.command,
            session.args.clone(),
            config.project_dir.clone(),
        )),
        None => Arc::new(NullSessionFactory),
    };

    // Stop signal: workers finish their current item, sessions terminate,
    // and the run stays resumable.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let ui = Arc::new(TrawlerUI::new(pipeline.steps.len() as u64, config.verbose));
    let orchestrator = Orchestrator::new(
        config,
        pipeline,
        store as Arc<dyn CheckpointStore>,
        factory,
        shutdown_rx,
    )
    .with_ui(Arc::clone(&ui));

    let opts = RunOptions {
        mode: if fresh {
            StartMode::Fresh
        } else {
            StartMode::Resume
        },
        from_step: step,
        run_id,
    };

    match orchestrator.run(opts).await {
        Ok(summary) if summary.interrupted => {
            ui.finish("interrupted");
            println!(
                "Run {} interrupted; resume with `trawler run`",
                summary.run_id
            );
            Ok(EXIT_INTERRUPTED)
        }
        Ok(summary) => {
            ui.finish("completed");
            println!("Run {} completed", summary.run_id);
            Ok(0)
        }
        Err(e) => {
            ui.finish("failed");
            eprintln!("Error: {e:#}");
            Ok(e.exit_code())
        }
    }
}
