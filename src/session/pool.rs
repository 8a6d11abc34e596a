//! Bounded session pool.
//!
//! Capacity is a `tokio` semaphore; `acquire` is the system's only designed
//! blocking point outside handler I/O and always carries a timeout, whose
//! expiry surfaces as `WorkError::ResourceExhausted` rather than a hang. Idle
//! sessions are reused until `recycle_threshold` operations, then destroyed
//! and recreated. Every issued session is tracked in a registry persisted
//! next to the checkpoints, keyed by liveness token, which is what makes
//! orphan reaping possible after a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{Session, SessionFactory, SessionMeta, TerminationReason};
use crate::checkpoint::store::write_atomic;
use crate::errors::WorkError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub acquire_timeout: Duration,
    /// Destroy-and-recreate after this many operations on one session.
    pub recycle_threshold: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            acquire_timeout: Duration::from_secs(60),
            recycle_threshold: 200,
        }
    }
}

struct IdleEntry {
    token: String,
    session: Box<dyn Session>,
}

struct PoolState {
    idle: Vec<IdleEntry>,
    registry: HashMap<String, SessionMeta>,
}

/// A leased session plus the capacity permit backing it. Hand it back with
/// [`SessionPool::release`]; dropping it on the floor frees the permit but
/// leaves the registry entry for the shutdown sweep to close out.
pub struct PooledSession {
    token: String,
    session: Option<Box<dyn Session>>,
    operations: u64,
    worker_id: usize,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn session_mut(&mut self) -> &mut dyn Session {
        self.session
            .as_mut()
            .expect("leased session present until release")
            .as_mut()
    }

    pub fn liveness_token(&self) -> &str {
        &self.token
    }

    /// Count one operation against the recycle threshold.
    pub fn record_operation(&mut self) {
        self.operations += 1;
    }

    pub fn operations(&self) -> u64 {
        self.operations
    }
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    registry_path: PathBuf,
    config: PoolConfig,
    run_id: String,
}

impl SessionPool {
    /// Create the pool for one run, loading any registry left behind by
    /// earlier processes so their sessions remain sweepable.
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        config: PoolConfig,
        registry_path: PathBuf,
        run_id: &str,
    ) -> Self {
        let registry = std::fs::read_to_string(&registry_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self {
            factory,
            permits: Arc::new(Semaphore::new(config.max_instances)),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                registry,
            }),
            registry_path,
            config,
            run_id: run_id.to_string(),
        }
    }

    /// Acquire a session, creating one if no idle session is available.
    /// Blocks up to `acquire_timeout` for a capacity permit.
    pub async fn acquire(&self, worker_id: usize) -> Result<PooledSession, WorkError> {
        let started = Instant::now();
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| WorkError::ResourceExhausted {
            waited_ms: started.elapsed().as_millis() as u64,
        })?
        .expect("pool semaphore is never closed");

        // Reuse an idle session when one is waiting.
        let reusable = {
            let mut state = self.state.lock().expect("pool state lock");
            state.idle.pop()
        };
        if let Some(entry) = reusable {
            let operations = {
                let state = self.state.lock().expect("pool state lock");
                state
                    .registry
                    .get(&entry.token)
                    .map(|m| m.operations_served)
                    .unwrap_or(0)
            };
            debug!(worker_id, token = %entry.token, "reusing idle session");
            return Ok(PooledSession {
                token: entry.token,
                session: Some(entry.session),
                operations,
                worker_id,
                _permit: permit,
            });
        }

        let session = self.factory.create().await?;
        let token = session.liveness_token();
        let meta = SessionMeta::new(&self.run_id, worker_id, token.clone());
        info!(worker_id, token = %token, session_id = %meta.session_id, "session created");
        {
            let mut state = self.state.lock().expect("pool state lock");
            state.registry.insert(token.clone(), meta);
            self.persist(&state)?;
        }

        Ok(PooledSession {
            token,
            session: Some(session),
            operations: 0,
            worker_id,
            _permit: permit,
        })
    }

    /// Return a session to the pool. Sessions over the recycle threshold or
    /// no longer alive are destroyed instead of parked.
    pub async fn release(&self, mut lease: PooledSession) -> Result<(), WorkError> {
        let session = lease.session.take().expect("lease holds session");
        let alive = session.is_alive();
        let over_threshold = lease.operations >= self.config.recycle_threshold;

        {
            let mut state = self.state.lock().expect("pool state lock");
            if let Some(meta) = state.registry.get_mut(&lease.token) {
                meta.operations_served = lease.operations;
            }
            if alive && !over_threshold {
                state.idle.push(IdleEntry {
                    token: lease.token.clone(),
                    session,
                });
                self.persist(&state)?;
                return Ok(());
            }
            let reason = if alive {
                TerminationReason::Recycled
            } else {
                TerminationReason::Crashed
            };
            if let Some(meta) = state.registry.get_mut(&lease.token) {
                meta.terminate(reason);
            }
            self.persist(&state)?;
        }

        debug!(token = %lease.token, alive, over_threshold, "destroying session on release");
        self.factory.destroy(session).await
    }

    /// Destroy a crashed session and create a replacement in place, keeping
    /// the lease's capacity permit. Used by workers after a detected crash
    /// so a bad session never aborts the step.
    pub async fn recycle(&self, lease: &mut PooledSession) -> Result<(), WorkError> {
        let old = lease.session.take().expect("lease holds session");
        {
            let mut state = self.state.lock().expect("pool state lock");
            if let Some(meta) = state.registry.get_mut(&lease.token) {
                meta.operations_served = lease.operations;
                meta.terminate(TerminationReason::Crashed);
            }
            self.persist(&state)?;
        }
        if let Err(e) = self.factory.destroy(old).await {
            warn!(token = %lease.token, error = %e, "destroy of crashed session failed");
        }

        let session = self.factory.create().await?;
        let token = session.liveness_token();
        let meta = SessionMeta::new(&self.run_id, lease.worker_id, token.clone());
        info!(worker_id = lease.worker_id, token = %token, "session recycled");
        {
            let mut state = self.state.lock().expect("pool state lock");
            state.registry.insert(token.clone(), meta);
            self.persist(&state)?;
        }
        lease.token = token;
        lease.session = Some(session);
        lease.operations = 0;
        Ok(())
    }

    /// Terminate every session this run still owns. Idempotent: already
    /// terminated entries are skipped, so a shutdown signal followed by the
    /// normal exit path terminates each session exactly once.
    pub async fn terminate_all(&self, reason: TerminationReason) -> Result<(), WorkError> {
        let (idle, stragglers) = {
            let mut state = self.state.lock().expect("pool state lock");
            let idle: Vec<IdleEntry> = state.idle.drain(..).collect();
            for entry in &idle {
                if let Some(meta) = state.registry.get_mut(&entry.token) {
                    meta.terminate(reason);
                }
            }
            let stragglers: Vec<String> = state
                .registry
                .values_mut()
                .filter(|m| m.run_id == self.run_id && m.terminated_at.is_none())
                .map(|m| {
                    m.terminate(reason);
                    m.liveness_token.clone()
                })
                .collect();
            self.persist(&state)?;
            (idle, stragglers)
        };

        futures::future::join_all(idle.into_iter().map(|entry| async move {
            if let Err(e) = self.factory.destroy(entry.session).await {
                warn!(token = %entry.token, error = %e, "destroy during terminate_all failed");
            }
        }))
        .await;
        // Sessions still leased (worker died without release) are only known
        // by token; reap covers them.
        for token in stragglers {
            if let Err(e) = self.factory.reap(&token).await {
                warn!(token = %token, error = %e, "reap during terminate_all failed");
            }
        }
        Ok(())
    }

    /// Startup sweep: force-terminate registry entries owned by runs that
    /// are no longer running. This is the orphan-process cleanup path.
    pub async fn sweep_orphans(&self, running_run_ids: &[String]) -> Result<usize, WorkError> {
        self.reap_where(|meta| {
            meta.run_id != self.run_id && !running_run_ids.contains(&meta.run_id)
        })
        .await
    }

    /// Stale recovery: terminate every surviving session of one dead run.
    pub async fn reap_run(&self, run_id: &str) -> Result<usize, WorkError> {
        self.reap_where(|meta| meta.run_id == run_id).await
    }

    async fn reap_where(
        &self,
        predicate: impl Fn(&SessionMeta) -> bool,
    ) -> Result<usize, WorkError> {
        let tokens: Vec<String> = {
            let mut state = self.state.lock().expect("pool state lock");
            let tokens: Vec<String> = state
                .registry
                .values_mut()
                .filter(|m| m.terminated_at.is_none() && predicate(m))
                .map(|m| {
                    m.terminate(TerminationReason::OrphanSweep);
                    m.liveness_token.clone()
                })
                .collect();
            if !tokens.is_empty() {
                self.persist(&state)?;
            }
            tokens
        };

        for token in &tokens {
            info!(token = %token, "reaping orphaned session");
            if let Err(e) = self.factory.reap(token).await {
                warn!(token = %token, error = %e, "orphan reap failed");
            }
        }
        Ok(tokens.len())
    }

    /// Snapshot of the registry, for status reporting and tests.
    pub fn registry_snapshot(&self) -> Vec<SessionMeta> {
        let state = self.state.lock().expect("pool state lock");
        let mut metas: Vec<SessionMeta> = state.registry.values().cloned().collect();
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        metas
    }

    fn persist(&self, state: &PoolState) -> Result<(), WorkError> {
        let json = serde_json::to_string_pretty(&state.registry)
            .expect("session registry serializes to JSON");
        write_atomic(&self.registry_path, json.as_bytes())
            .map_err(|e| WorkError::Fatal(format!("failed to persist session registry: {e}")))
    }

    /// Load a registry file without constructing a pool. Used by status
    /// reporting.
    pub fn load_registry(path: &Path) -> HashMap<String, SessionMeta> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }
}
