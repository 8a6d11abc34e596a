//! Pool-managed expensive resources.
//!
//! A session is an opaque long-lived resource (typically a browser or
//! automation driver process) created and destroyed by an externally
//! supplied [`SessionFactory`]. The core never looks inside one; it only
//! tracks lifecycle metadata and a PID-style liveness token so sessions
//! orphaned by a crashed run can be reaped on the next start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::WorkError;

pub mod pool;
pub mod process;

pub use pool::{PoolConfig, PooledSession, SessionPool};
pub use process::{NullSessionFactory, ProcessSessionFactory};

/// The opaque resource a worker drives.
pub trait Session: Send {
    /// PID-equivalent token used for orphan tracking across process
    /// restarts.
    fn liveness_token(&self) -> String;

    /// Whether the underlying resource still responds.
    fn is_alive(&self) -> bool;
}

/// Externally supplied lifecycle for sessions. The core only calls these
/// and records metadata.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Session>, WorkError>;

    async fn destroy(&self, session: Box<dyn Session>) -> Result<(), WorkError>;

    /// Force-terminate a session left behind by a previous process, known
    /// only by its liveness token. Factories whose sessions die with the
    /// process can keep the default no-op.
    async fn reap(&self, token: &str) -> Result<(), WorkError> {
        let _ = token;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Recycled,
    Crashed,
    Shutdown,
    OrphanSweep,
}

/// Registry entry for every session the pool ever issued. Persisted so a
/// later process can sweep orphans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub worker_id: usize,
    pub run_id: String,
    pub liveness_token: String,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
    pub operations_served: u64,
}

impl SessionMeta {
    pub fn new(run_id: &str, worker_id: usize, liveness_token: String) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            worker_id,
            run_id: run_id.to_string(),
            liveness_token,
            created_at: Utc::now(),
            terminated_at: None,
            termination_reason: None,
            operations_served: 0,
        }
    }

    /// Record termination exactly once; later calls are no-ops.
    pub fn terminate(&mut self, reason: TerminationReason) -> bool {
        if self.terminated_at.is_some() {
            return false;
        }
        self.terminated_at = Some(Utc::now());
        self.termination_reason = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_is_idempotent() {
        let mut meta = SessionMeta::new("run-1", 0, "pid:4242".into());
        assert!(meta.terminate(TerminationReason::Shutdown));
        let first = meta.terminated_at;
        assert!(!meta.terminate(TerminationReason::OrphanSweep));
        assert_eq!(meta.terminated_at, first);
        assert_eq!(meta.termination_reason, Some(TerminationReason::Shutdown));
    }

    #[test]
    fn meta_roundtrips_through_json() {
        let meta = SessionMeta::new("run-1", 3, "pid:77".into());
        let json = serde_json::to_string(&meta).unwrap();
        let back: SessionMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_id, 3);
        assert_eq!(back.liveness_token, "pid:77");
        assert!(back.terminated_at.is_none());
    }
}
