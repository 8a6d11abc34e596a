//! Run orchestration.
//!
//! One orchestrator drives the ordered steps of a pipeline run: it decides
//! skip-vs-execute per step from checkpoint state, recovers stale runs on
//! startup, enforces the one-running-run-per-pipeline invariant with an
//! exclusive file lock, and computes run-level aggregates at the end.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use fs2::FileExt;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::checkpoint::{
    CheckpointStore, RunMode, RunRecord, RunStatus, StepStatus, verify::verify_outputs,
};
use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::ledger::{LedgerEntry, RunLedger, StepSummary};
use crate::pipeline::Pipeline;
use crate::runner::{StepDisposition, StepRunner};
use crate::session::{SessionFactory, SessionPool, TerminationReason};
use crate::ui::TrawlerUI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Fresh,
    Resume,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: StartMode,
    /// Force execution to begin here; earlier steps are treated as
    /// satisfied, later ones re-execute regardless of checkpoints.
    pub from_step: Option<u32>,
    /// Resume a specific historical run instead of the latest.
    pub run_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: StartMode::Resume,
            from_step: None,
            run_id: None,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub interrupted: bool,
}

/// Held for the process lifetime; releasing the file lock is what lets the
/// next `trawler run` start.
struct RunLock {
    _file: std::fs::File,
}

enum SkipDecision {
    Skip,
    Execute,
    ExecuteFromScratch,
}

pub struct Orchestrator {
    config: Config,
    pipeline: Pipeline,
    store: Arc<dyn CheckpointStore>,
    ledger: RunLedger,
    factory: Arc<dyn SessionFactory>,
    shutdown: watch::Receiver<bool>,
    ui: Option<Arc<TrawlerUI>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        pipeline: Pipeline,
        store: Arc<dyn CheckpointStore>,
        factory: Arc<dyn SessionFactory>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ledger = RunLedger::new(
            config
                .state_dir
                .join(&pipeline.name)
                .join("ledger.jsonl"),
        );
        Self {
            config,
            pipeline,
            store,
            ledger,
            factory,
            shutdown,
            ui: None,
        }
    }

    pub fn with_ui(mut self, ui: Arc<TrawlerUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub async fn run(&self, opts: RunOptions) -> Result<RunSummary, OrchestratorError> {
        self.pipeline
            .validate()
            .map_err(OrchestratorError::InvalidPipeline)?;
        let _lock = self.acquire_run_lock()?;

        let mut run = self.resolve_run(&opts)?;
        let recovered_from_stale = self.recover_if_needed(&mut run)?;

        run.status = RunStatus::Running;
        run.heartbeat_at = Utc::now();
        self.publish(&run)?;
        info!(run_id = %run.run_id, mode = ?run.mode, pipeline = %self.pipeline.name, "run started");

        // The pool is scoped to this run; the shared registry file is what
        // lets it sweep sessions orphaned by earlier processes.
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&self.factory),
            self.config.limits.pool_config(),
            self.registry_path(),
            &run.run_id,
        ));
        match pool.sweep_orphans(&[run.run_id.clone()]).await {
            Ok(0) => {}
            Ok(n) => info!(sessions = n, "orphaned sessions reaped"),
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }
        if recovered_from_stale {
            if let Err(e) = pool.reap_run(&run.run_id).await {
                warn!(error = %e, "reaping stale run sessions failed");
            }
        }

        let runner = StepRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&pool),
            self.config.limits.clone(),
            self.config.data_dir.clone(),
            self.shutdown.clone(),
        );

        let outcome = self.drive_steps(&mut run, &runner, &opts).await;
        pool.terminate_all(TerminationReason::Shutdown).await.ok();
        outcome
    }

    async fn drive_steps(
        &self,
        run: &mut RunRecord,
        runner: &StepRunner,
        opts: &RunOptions,
    ) -> Result<RunSummary, OrchestratorError> {
        for step in &self.pipeline.steps {
            let number = step.spec.number;

            if *self.shutdown.borrow() {
                info!(run_id = %run.run_id, "stop requested between steps; run stays resumable");
                self.publish(run)?;
                return Ok(RunSummary {
                    run_id: run.run_id.clone(),
                    status: run.status,
                    interrupted: true,
                });
            }

            if let Some(from) = opts.from_step {
                if number < from {
                    // Treated as satisfied; recorded so the ledger shows the
                    // decision.
                    if self.store.step_record(&run.run_id, number)?.is_none() {
                        self.store
                            .mark_step_skipped(&run.run_id, number, &step.spec.name)?;
                    }
                    info!(step = number, "step before --step start; treated as satisfied");
                    continue;
                }
                // Forced re-execution ignores whatever the checkpoint says.
                let reset = self.store.reset_step_items(&run.run_id, number)?;
                if reset > 0 {
                    info!(step = number, items = reset, "item records reset for forced re-run");
                }
            } else {
                match self.skip_decision(&run.run_id, number, &step.spec.outputs)? {
                    SkipDecision::Skip => {
                        info!(step = number, name = %step.spec.name, "step already complete and verified; skipping");
                        if let Some(ui) = &self.ui {
                            ui.step_skipped(number, &step.spec.name);
                        }
                        continue;
                    }
                    SkipDecision::ExecuteFromScratch => {
                        // A completed step whose outputs no longer verify is
                        // re-run in full; its stale item records must not
                        // mask the work.
                        self.store.reset_step_items(&run.run_id, number)?;
                    }
                    SkipDecision::Execute => {}
                }
            }

            if let Some(ui) = &self.ui {
                ui.start_step(number, &step.spec.name);
            }

            match runner.run_step(&run.run_id, step).await? {
                StepDisposition::Completed { exhausted } => {
                    if !exhausted.is_empty() {
                        warn!(
                            step = number,
                            exhausted = exhausted.len(),
                            "step completed with items on the fallback path"
                        );
                    }
                    if let Some(ui) = &self.ui {
                        ui.step_completed(number);
                    }
                    self.publish(run)?;
                }
                StepDisposition::Interrupted => {
                    self.publish(run)?;
                    return Ok(RunSummary {
                        run_id: run.run_id.clone(),
                        status: run.status,
                        interrupted: true,
                    });
                }
                StepDisposition::Failed { message } => {
                    run.status = RunStatus::Failed;
                    run.failure_step = Some(number);
                    self.finalize(run)?;
                    if let Some(ui) = &self.ui {
                        ui.step_failed(number, &message);
                    }
                    return Err(OrchestratorError::StepFailed {
                        step: number,
                        message,
                    });
                }
            }
        }

        run.status = RunStatus::Completed;
        self.finalize(run)?;
        info!(
            run_id = %run.run_id,
            runtime_secs = run.total_runtime_secs,
            slowest_step = run.slowest_step,
            "run completed"
        );
        Ok(RunSummary {
            run_id: run.run_id.clone(),
            status: RunStatus::Completed,
            interrupted: false,
        })
    }

    /// Pick the run this invocation operates on.
    fn resolve_run(&self, opts: &RunOptions) -> Result<RunRecord, OrchestratorError> {
        if opts.mode == StartMode::Fresh {
            // Prior checkpoints are ignored, never deleted.
            return Ok(RunRecord::new(&self.pipeline.name, RunMode::Fresh));
        }
        if let Some(run_id) = &opts.run_id {
            return self
                .store
                .load_run(run_id)
                .map_err(|_| OrchestratorError::RunNotFound(run_id.clone()))
                .map(|mut run| {
                    run.mode = RunMode::Resume;
                    run
                });
        }
        match self.store.latest_run()? {
            Some(mut run) => {
                run.mode = RunMode::Resume;
                Ok(run)
            }
            None => Ok(RunRecord::new(&self.pipeline.name, RunMode::Fresh)),
        }
    }

    /// Startup recovery for a run still marked `Running`. Holding the run
    /// lock proves its process is gone; a heartbeat past the staleness
    /// threshold additionally routes it through `Stale`, records the
    /// recovery step, and schedules its sessions for reaping.
    fn recover_if_needed(&self, run: &mut RunRecord) -> Result<bool, OrchestratorError> {
        if run.status != RunStatus::Running {
            return Ok(false);
        }

        let stale = run.is_stale(self.config.limits.stale_after_secs);
        if stale {
            run.status = RunStatus::Stale;
            self.store.save_run(run)?;
            warn!(run_id = %run.run_id, "stale run detected; recovering");
        }

        let reset = self.store.reset_in_progress_steps(&run.run_id)?;
        if !reset.is_empty() {
            info!(steps = ?reset, "in-progress steps returned to pending; item progress kept");
        }

        if stale {
            run.recovery_step = self.lowest_incomplete_step(&run.run_id)?;
            info!(run_id = %run.run_id, recovery_step = run.recovery_step, "stale run recovered");
        }
        Ok(stale)
    }

    fn lowest_incomplete_step(&self, run_id: &str) -> Result<Option<u32>, OrchestratorError> {
        for step in &self.pipeline.steps {
            let status = self.store.step_status(run_id, step.spec.number)?;
            if !matches!(status, StepStatus::Completed | StepStatus::Skipped) {
                return Ok(Some(step.spec.number));
            }
        }
        Ok(None)
    }

    /// Skip only on a verified complete: the checkpoint must say so AND the
    /// declared outputs must still exist.
    fn skip_decision(
        &self,
        run_id: &str,
        step: u32,
        outputs: &[String],
    ) -> Result<SkipDecision, OrchestratorError> {
        let status = self.store.step_status(run_id, step)?;
        if !matches!(status, StepStatus::Completed | StepStatus::Skipped) {
            return Ok(SkipDecision::Execute);
        }
        match verify_outputs(&self.config.data_dir, outputs) {
            Ok(()) => Ok(SkipDecision::Skip),
            Err(detail) => {
                warn!(step, %detail, "completed step failed re-verification; re-executing");
                Ok(SkipDecision::ExecuteFromScratch)
            }
        }
    }

    /// Final aggregates plus the closing ledger row.
    fn finalize(&self, run: &mut RunRecord) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        run.finished_at = Some(now);
        run.total_runtime_secs =
            Some(now.signed_duration_since(run.started_at).num_milliseconds() as f64 / 1000.0);

        let summaries = self.step_summaries(&run.run_id)?;
        run.slowest_step = summaries
            .iter()
            .filter(|s| s.duration_secs.is_some())
            .max_by(|a, b| {
                a.duration_secs
                    .partial_cmp(&b.duration_secs)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.step_number);

        self.store.save_run(run)?;
        self.ledger.upsert(&LedgerEntry::from_run(run, summaries))?;
        Ok(())
    }

    fn publish(&self, run: &RunRecord) -> Result<(), OrchestratorError> {
        self.store.save_run(run)?;
        let summaries = self.step_summaries(&run.run_id)?;
        self.ledger.upsert(&LedgerEntry::from_run(run, summaries))?;
        Ok(())
    }

    fn step_summaries(&self, run_id: &str) -> Result<Vec<StepSummary>, OrchestratorError> {
        let mut summaries = Vec::new();
        for step in &self.pipeline.steps {
            if let Some(record) = self.store.step_record(run_id, step.spec.number)? {
                summaries.push(StepSummary::from(&record));
            }
        }
        Ok(summaries)
    }

    fn registry_path(&self) -> PathBuf {
        self.config
            .state_dir
            .join(&self.pipeline.name)
            .join("sessions.json")
    }

    fn acquire_run_lock(&self) -> Result<RunLock, OrchestratorError> {
        let dir = self.config.state_dir.join(&self.pipeline.name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e).context("create state dir")))?;
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!(e).context("open run lock")))?;
        file.try_lock_exclusive()
            .map_err(|_| OrchestratorError::RunAlreadyActive(self.pipeline.name.clone()))?;
        Ok(RunLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FileCheckpointStore, ItemRecord, ItemState};
    use crate::config::Limits;
    use crate::errors::WorkError;
    use crate::pipeline::{OutputDescriptor, StepHandler, StepSpec};
    use crate::runner::ProgressSink;
    use crate::session::{NullSessionFactory, Session, SessionMeta, SessionPool};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingHandler {
        keys: Vec<String>,
        calls: AtomicU32,
        fail: bool,
        output_file: Option<PathBuf>,
    }

    #[async_trait]
    impl StepHandler for CountingHandler {
        async fn plan(&self) -> Result<Vec<String>, WorkError> {
            Ok(self.keys.clone())
        }

        async fn execute(
            &self,
            _item_key: &str,
            _session: &mut dyn Session,
            _progress: &ProgressSink,
        ) -> Result<Option<OutputDescriptor>, WorkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WorkError::Fatal("scripted failure".into()));
            }
            if let Some(path) = &self.output_file {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, "rows\n").unwrap();
            }
            Ok(None)
        }
    }

    struct Fixture {
        config: Config,
        store: Arc<FileCheckpointStore>,
        shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("pipeline.toml"),
            "name = \"books\"\nsteps = []\n",
        )
        .unwrap();
        let mut config = Config::new(dir.path().to_path_buf(), false, None).unwrap();
        config.state_dir = dir.path().join("state");
        config.data_dir = dir.path().join("data");
        config.limits = Limits {
            retry_base_ms: 1,
            retry_cap_ms: 2,
            stale_after_secs: 600,
            ..Limits::default()
        };
        config.ensure_directories().unwrap();
        let store = Arc::new(FileCheckpointStore::open(&config.state_dir, "books").unwrap());
        let (shutdown_tx, _) = watch::channel(false);
        Fixture {
            config,
            store,
            shutdown_tx,
            _dir: dir,
        }
    }

    fn orchestrator(f: &Fixture, pipeline: Pipeline) -> Orchestrator {
        Orchestrator::new(
            f.config.clone(),
            pipeline,
            Arc::clone(&f.store) as Arc<dyn CheckpointStore>,
            Arc::new(NullSessionFactory),
            f.shutdown_tx.subscribe(),
        )
    }

    fn two_step_pipeline(first: Arc<CountingHandler>, second: Arc<CountingHandler>) -> Pipeline {
        Pipeline::new("books")
            .step(StepSpec::new(1, "collect"), first)
            .step(StepSpec::new(2, "export"), second)
    }

    #[tokio::test]
    async fn full_run_completes_with_aggregates() {
        let f = fixture();
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let orch = orchestrator(&f, two_step_pipeline(first, second));

        let summary = orch.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(!summary.interrupted);

        let run = f.store.load_run(&summary.run_id).unwrap();
        assert!(run.total_runtime_secs.is_some());
        assert!(run.slowest_step.is_some());
        assert!(run.failure_step.is_none());

        let ledger = RunLedger::new(f.config.state_dir.join("books/ledger.jsonl"));
        let entry = ledger.latest().unwrap().unwrap();
        assert_eq!(entry.run_id, summary.run_id);
        assert_eq!(entry.steps.len(), 2);
    }

    #[tokio::test]
    async fn resume_skips_verified_complete_steps() {
        let f = fixture();
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let orch = orchestrator(
            &f,
            two_step_pipeline(Arc::clone(&first), Arc::clone(&second)),
        );

        orch.run(RunOptions::default()).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);

        // Same pipeline again: everything skips, handlers untouched.
        let summary = orch.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_ignores_prior_checkpoints() {
        let f = fixture();
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let orch = orchestrator(
            &f,
            two_step_pipeline(Arc::clone(&first), Arc::clone(&second)),
        );

        let a = orch.run(RunOptions::default()).await.unwrap();
        let b = orch
            .run(RunOptions {
                mode: StartMode::Fresh,
                ..RunOptions::default()
            })
            .await
            .unwrap();

        assert_ne!(a.run_id, b.run_id);
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        // The first run's checkpoints are ignored, not deleted.
        assert!(f.store.load_run(&a.run_id).is_ok());
    }

    #[tokio::test]
    async fn completed_step_with_missing_outputs_reexecutes() {
        let f = fixture();
        let out = f.config.data_dir.join("out/rows.csv");
        let first = Arc::new(CountingHandler {
            output_file: Some(out.clone()),
            ..CountingHandler::default()
        });
        let pipeline = Pipeline::new("books").step(
            StepSpec::new(1, "collect").with_outputs(vec!["out/*.csv".to_string()]),
            Arc::clone(&first) as Arc<dyn StepHandler>,
        );
        let orch = orchestrator(&f, pipeline);

        orch.run(RunOptions::default()).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);

        // Corrupt the prior run's output; the skip check must notice.
        std::fs::remove_file(&out).unwrap();
        orch.run(RunOptions::default()).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_step_fails_run_and_halts() {
        let f = fixture();
        let first = Arc::new(CountingHandler {
            fail: true,
            ..CountingHandler::default()
        });
        let second = Arc::new(CountingHandler::default());
        let orch = orchestrator(
            &f,
            two_step_pipeline(Arc::clone(&first), Arc::clone(&second)),
        );

        let err = orch.run(RunOptions::default()).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(matches!(err, OrchestratorError::StepFailed { step: 1, .. }));

        // No subsequent step ran.
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);

        let run = f.store.latest_run().unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_step, Some(1));
    }

    #[tokio::test]
    async fn from_step_satisfies_earlier_and_forces_later() {
        let f = fixture();
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let orch = orchestrator(
            &f,
            two_step_pipeline(Arc::clone(&first), Arc::clone(&second)),
        );

        // Complete everything once.
        orch.run(RunOptions::default()).await.unwrap();

        // --step 2: step 1 stays satisfied, step 2 re-executes despite its
        // completed checkpoint.
        orch.run(RunOptions {
            from_step: Some(2),
            ..RunOptions::default()
        })
        .await
        .unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_run_recovers_with_recovery_step() {
        let f = fixture();
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler {
            keys: vec!["page-1".into(), "page-2".into()],
            ..CountingHandler::default()
        });
        let orch = orchestrator(
            &f,
            two_step_pipeline(Arc::clone(&first), Arc::clone(&second)),
        );

        // Simulate a crashed run: step 1 completed, step 2 mid-flight, no
        // heartbeat for an hour, a session still registered.
        let mut run = RunRecord::new("books", RunMode::Fresh);
        run.status = RunStatus::Running;
        run.heartbeat_at = Utc::now() - chrono::Duration::hours(1);
        f.store.save_run(&run).unwrap();
        f.store
            .mark_step_in_progress(&run.run_id, 1, "collect")
            .unwrap();
        f.store
            .mark_step_complete(&run.run_id, 1, &[], &f.config.data_dir)
            .unwrap();
        f.store
            .mark_step_in_progress(&run.run_id, 2, "export")
            .unwrap();
        let mut done_item = ItemRecord::pending("page-1");
        done_item.state = ItemState::Done;
        f.store.upsert_item(&run.run_id, 2, &done_item).unwrap();
        f.store
            .upsert_item(&run.run_id, 2, &ItemRecord::pending("page-2"))
            .unwrap();

        let registry_path = f.config.state_dir.join("books/sessions.json");
        let meta = SessionMeta::new(&run.run_id, 0, "null:dead".into());
        std::fs::write(
            &registry_path,
            serde_json::to_string_pretty(&std::collections::HashMap::from([(
                meta.liveness_token.clone(),
                meta,
            )]))
            .unwrap(),
        )
        .unwrap();

        let summary = orch.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.run_id, run.run_id);

        let recovered = f.store.load_run(&run.run_id).unwrap();
        assert_eq!(recovered.recovery_step, Some(2));

        // Step 1 skipped (still completed), step 2 resumed only its
        // incomplete item.
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        // The crashed run's session was terminated exactly once.
        let registry = SessionPool::load_registry(&registry_path);
        let old = registry.get("null:dead").unwrap();
        assert_eq!(old.termination_reason, Some(TerminationReason::OrphanSweep));
    }

    #[tokio::test]
    async fn second_active_run_is_rejected() {
        let f = fixture();
        let pipeline = two_step_pipeline(
            Arc::new(CountingHandler::default()),
            Arc::new(CountingHandler::default()),
        );
        let orch = orchestrator(&f, pipeline);

        // Hold the lock the way a live orchestrator would.
        let lock_path = f.config.state_dir.join("books/.lock");
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .unwrap();
        file.try_lock_exclusive().unwrap();

        let err = orch.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RunAlreadyActive(_)));
        assert_eq!(err.exit_code(), 2);
        fs2::FileExt::unlock(&file).unwrap();
    }

    #[tokio::test]
    async fn unknown_run_id_is_rejected() {
        let f = fixture();
        let pipeline = two_step_pipeline(
            Arc::new(CountingHandler::default()),
            Arc::new(CountingHandler::default()),
        );
        let orch = orchestrator(&f, pipeline);

        let err = orch
            .run(RunOptions {
                run_id: Some("does-not-exist".into()),
                ..RunOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RunNotFound(_)));
        assert_eq!(err.exit_code(), 2);
    }
}
