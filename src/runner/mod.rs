//! Step execution.
//!
//! `StepRunner` drives one step to a terminal state: it loads or seeds the
//! step's work items, fans them out to a bounded set of worker tasks backed
//! by pooled sessions, routes every failure through the retry scheduler,
//! and checkpoints after every item so a crash loses at most one in-flight
//! unit of work. Declared outputs are re-verified before the step record
//! flips to completed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    CheckpointStore, ItemRecord, ItemState, RowMetrics, SENTINEL_KEY, StepProgressRecord,
    StepStatus,
};
use crate::config::Limits;
use crate::errors::{OrchestratorError, WorkError};
use crate::pipeline::{PipelineStep, StepHandler};
use crate::retry::{RetryAction, RetryPolicy, WorkQueue};
use crate::session::{PooledSession, SessionPool};

/// Heartbeat contract handed to step handlers. Reported row metrics are
/// accumulated into the step's progress record; every report also
/// refreshes the run heartbeat that stale detection watches.
pub struct ProgressSink {
    store: Arc<dyn CheckpointStore>,
    record: Mutex<StepProgressRecord>,
}

impl ProgressSink {
    pub(crate) fn new(store: Arc<dyn CheckpointStore>, record: StepProgressRecord) -> Self {
        Self {
            store,
            record: Mutex::new(record),
        }
    }

    pub fn report_progress(&self, read: u64, processed: u64, inserted: u64, rejected: u64) {
        let mut record = self.record.lock().expect("progress record lock");
        record.metrics.accumulate(&RowMetrics {
            read,
            processed,
            inserted,
            rejected,
        });
        let run_id = record.run_id.clone();
        if let Err(e) = self.store.save_step(&record) {
            warn!(error = %e, "progress metrics write failed");
        }
        drop(record);
        if let Err(e) = self.store.touch_heartbeat(&run_id) {
            warn!(error = %e, "heartbeat write failed");
        }
    }
}

/// Terminal outcome of one step execution.
#[derive(Debug)]
pub enum StepDisposition {
    Completed { exhausted: Vec<String> },
    Failed { message: String },
    /// Stop signal arrived mid-step; the step record stays `InProgress`
    /// and the run resumes through the stale-recovery path.
    Interrupted,
}

struct WorkerShared {
    store: Arc<dyn CheckpointStore>,
    pool: Arc<SessionPool>,
    policy: RetryPolicy,
    handler: Arc<dyn StepHandler>,
    sink: Arc<ProgressSink>,
    queue: Arc<WorkQueue>,
    run_id: String,
    step_number: u32,
    item_timeout: Duration,
    fatal: Mutex<Option<String>>,
    exhausted: Mutex<Vec<String>>,
    done: AtomicUsize,
    shutdown: watch::Receiver<bool>,
}

pub struct StepRunner {
    store: Arc<dyn CheckpointStore>,
    pool: Arc<SessionPool>,
    limits: Limits,
    data_dir: PathBuf,
    shutdown: watch::Receiver<bool>,
}

impl StepRunner {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        pool: Arc<SessionPool>,
        limits: Limits,
        data_dir: PathBuf,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            pool,
            limits,
            data_dir,
            shutdown,
        }
    }

    pub async fn run_step(
        &self,
        run_id: &str,
        step: &PipelineStep,
    ) -> Result<StepDisposition, OrchestratorError> {
        let spec = &step.spec;
        let record = self
            .store
            .mark_step_in_progress(run_id, spec.number, &spec.name)?;
        info!(step = spec.number, name = %spec.name, retry = record.retry_count, "step started");

        // Work set: resume whatever is incomplete, or seed from the
        // handler's plan on first entry.
        let existing = self.store.list_items(run_id, spec.number)?;
        let mut exhausted: Vec<String> = Vec::new();
        let queue_items: Vec<ItemRecord> = if existing.is_empty() {
            let keys = match step.handler.plan().await {
                Ok(keys) => keys,
                Err(e) => {
                    let message = format!("plan failed: {e}");
                    self.store.mark_step_failed(run_id, spec.number, &message)?;
                    return Ok(StepDisposition::Failed { message });
                }
            };
            let keys = if keys.is_empty() {
                vec![SENTINEL_KEY.to_string()]
            } else {
                keys
            };
            let items: Vec<ItemRecord> =
                keys.iter().map(|key| ItemRecord::pending(key)).collect();
            for item in &items {
                self.store.upsert_item(run_id, spec.number, item)?;
            }
            debug!(step = spec.number, items = items.len(), "work items seeded");
            items
        } else {
            let mut pending = Vec::new();
            for mut item in existing {
                match item.state {
                    ItemState::Done => {}
                    ItemState::Exhausted => exhausted.push(item.item_key.clone()),
                    _ => {
                        item.state = ItemState::Pending;
                        pending.push(item);
                    }
                }
            }
            debug!(
                step = spec.number,
                pending = pending.len(),
                already_exhausted = exhausted.len(),
                "resuming incomplete work items"
            );
            pending
        };

        let queue = Arc::new(WorkQueue::new(queue_items));
        let sink = Arc::new(ProgressSink::new(Arc::clone(&self.store), record));

        if !queue.is_empty() {
            let shared = Arc::new(WorkerShared {
                store: Arc::clone(&self.store),
                pool: Arc::clone(&self.pool),
                policy: self.limits.retry_policy(),
                handler: Arc::clone(&step.handler),
                sink: Arc::clone(&sink),
                queue: Arc::clone(&queue),
                run_id: run_id.to_string(),
                step_number: spec.number,
                item_timeout: Duration::from_secs(self.limits.item_timeout_secs),
                fatal: Mutex::new(None),
                exhausted: Mutex::new(Vec::new()),
                done: AtomicUsize::new(0),
                shutdown: self.shutdown.clone(),
            });

            let workers = spec
                .concurrency
                .unwrap_or(self.limits.concurrency)
                .clamp(1, queue.len().max(1));
            let mut set = JoinSet::new();
            for worker_id in 0..workers {
                let shared = Arc::clone(&shared);
                set.spawn(async move { worker_loop(shared, worker_id).await });
            }

            // Background heartbeat so a long in-flight item never reads as
            // stale.
            let hb_store = Arc::clone(&self.store);
            let hb_run = run_id.to_string();
            let hb_every = Duration::from_secs(self.limits.heartbeat_interval_secs.max(1));
            let heartbeat = tokio::spawn(async move {
                let mut interval = tokio::time::interval(hb_every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = hb_store.touch_heartbeat(&hb_run) {
                        warn!(error = %e, "heartbeat write failed");
                    }
                }
            });

            self.join_workers(&mut set).await;
            heartbeat.abort();

            if let Some(message) = shared.fatal.lock().expect("fatal lock").take() {
                self.store.mark_step_failed(run_id, spec.number, &message)?;
                error!(step = spec.number, %message, "step failed");
                return Ok(StepDisposition::Failed { message });
            }

            if *self.shutdown.borrow() && !queue.is_empty() {
                info!(
                    step = spec.number,
                    remaining = queue.len(),
                    "step interrupted; progress checkpointed"
                );
                return Ok(StepDisposition::Interrupted);
            }

            if !queue.is_empty() {
                // Workers exited without a fatal error and without draining
                // the queue: no sessions could be acquired.
                let message =
                    format!("{} item(s) unserved: no session could be acquired", queue.len());
                self.store.mark_step_failed(run_id, spec.number, &message)?;
                return Ok(StepDisposition::Failed { message });
            }

            exhausted.extend(shared.exhausted.lock().expect("exhausted lock").drain(..));
        }

        if !exhausted.is_empty() && self.limits.fail_on_exhausted {
            let message = format!(
                "{} item(s) exhausted their loop budget: {}",
                exhausted.len(),
                exhausted.join(", ")
            );
            self.store.mark_step_failed(run_id, spec.number, &message)?;
            return Ok(StepDisposition::Failed { message });
        }

        match self
            .store
            .mark_step_complete(run_id, spec.number, &spec.outputs, &self.data_dir)?
        {
            StepStatus::Completed => {
                info!(
                    step = spec.number,
                    exhausted = exhausted.len(),
                    "step completed"
                );
                Ok(StepDisposition::Completed { exhausted })
            }
            _ => {
                let message = self
                    .store
                    .step_record(run_id, spec.number)?
                    .and_then(|r| r.error_message)
                    .unwrap_or_else(|| "output verification failed".to_string());
                error!(step = spec.number, %message, "step failed verification");
                Ok(StepDisposition::Failed { message })
            }
        }
    }

    /// Wait for workers, honoring the stop signal: once it fires, in-flight
    /// items get the grace window to finish and persist, then remaining
    /// workers are aborted.
    async fn join_workers(&self, set: &mut JoinSet<()>) {
        async fn drain(set: &mut JoinSet<()>) {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!(error = %e, "worker panicked");
                    }
                }
            }
        }

        let grace = Duration::from_secs(self.limits.shutdown_grace_secs);
        let mut shutdown = self.shutdown.clone();

        if !*shutdown.borrow() {
            enum Wait {
                Drained,
                Stop,
            }
            let outcome = tokio::select! {
                _ = drain(set) => Wait::Drained,
                _ = shutdown.changed() => Wait::Stop,
            };
            if matches!(outcome, Wait::Drained) {
                return;
            }
            info!(grace_secs = grace.as_secs(), "stop requested; letting workers finish in-flight items");
        }

        if tokio::time::timeout(grace, drain(set)).await.is_err() {
            warn!("grace deadline passed; aborting remaining workers");
            set.abort_all();
            drain(set).await;
        }
    }
}

async fn worker_loop(shared: Arc<WorkerShared>, worker_id: usize) {
    let mut lease = match shared.pool.acquire(worker_id).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(worker_id, error = %e, "worker could not acquire a session");
            return;
        }
    };

    loop {
        if *shared.shutdown.borrow() {
            break;
        }
        if shared.fatal.lock().expect("fatal lock").is_some() {
            break;
        }
        let Some(item) = shared.queue.claim() else {
            break;
        };
        if let Err(message) = process_item(&shared, &mut lease, item).await {
            *shared.fatal.lock().expect("fatal lock") = Some(message);
            break;
        }
    }

    if let Err(e) = shared.pool.release(lease).await {
        warn!(worker_id, error = %e, "session release failed");
    }
}

/// Run one claimed item to a resolution. `Err` carries a fatal message
/// that aborts the whole step; everything retryable is absorbed here.
async fn process_item(
    shared: &WorkerShared,
    lease: &mut PooledSession,
    mut item: ItemRecord,
) -> Result<(), String> {
    item.state = ItemState::InProgress;
    persist(shared, &mut item);

    loop {
        let started = Instant::now();
        let result = tokio::time::timeout(
            shared.item_timeout,
            shared
                .handler
                .execute(&item.item_key, lease.session_mut(), &shared.sink),
        )
        .await;
        lease.record_operation();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(WorkError::NetworkTimeout {
                context: format!("item '{}' exceeded the item deadline", item.item_key),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        match outcome {
            Ok(descriptor) => {
                if descriptor.as_ref().is_some_and(|d| d.is_empty()) {
                    let message = format!(
                        "item '{}' reported done with an empty output descriptor",
                        item.item_key
                    );
                    item.error_message = Some(message.clone());
                    item.state = ItemState::Pending;
                    persist(shared, &mut item);
                    return Err(message);
                }
                item.state = ItemState::Done;
                item.attempt_count += 1;
                item.error_message = None;
                persist(shared, &mut item);
                shared.done.fetch_add(1, Ordering::SeqCst);
                debug!(item = %item.item_key, "item done");
                return Ok(());
            }
            Err(e) if !e.is_retryable() => {
                let message = format!("item '{}': {e}", item.item_key);
                item.error_message = Some(e.to_string());
                item.state = ItemState::Pending;
                persist(shared, &mut item);
                return Err(message);
            }
            Err(e) => {
                item.attempt_count += 1;
                item.error_message = Some(e.to_string());
                warn!(
                    item = %item.item_key,
                    attempt = item.attempt_count,
                    loop_pass = item.loop_count,
                    error = %e,
                    "item attempt failed"
                );

                if e.is_session_crash() {
                    if let Err(recycle_err) = shared.pool.recycle(lease).await {
                        return Err(format!("session recycle failed: {recycle_err}"));
                    }
                }

                match shared.policy.decide(&item) {
                    RetryAction::RetryAfter(delay) => {
                        persist(shared, &mut item);
                        tokio::time::sleep(delay).await;
                    }
                    RetryAction::Requeue => {
                        let mut snapshot = shared.queue.requeue(item);
                        persist(shared, &mut snapshot);
                        return Ok(());
                    }
                    RetryAction::Exhaust => {
                        item.loop_count += 1;
                        item.state = ItemState::Exhausted;
                        persist(shared, &mut item);
                        warn!(item = %item.item_key, "loop budget spent; handing item to fallback");
                        shared.handler.on_exhausted(&item.item_key).await;
                        shared
                            .exhausted
                            .lock()
                            .expect("exhausted lock")
                            .push(item.item_key.clone());
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Checkpoint one item and refresh the heartbeat. Write failures are
/// logged, not fatal; the item re-runs on resume.
fn persist(shared: &WorkerShared, item: &mut ItemRecord) {
    item.updated_at = Utc::now();
    if let Err(e) = shared
        .store
        .upsert_item(&shared.run_id, shared.step_number, item)
    {
        warn!(item = %item.item_key, error = %e, "item checkpoint write failed");
    }
    if let Err(e) = shared.store.touch_heartbeat(&shared.run_id) {
        warn!(error = %e, "heartbeat write failed");
    }
}
