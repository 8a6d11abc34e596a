//! Durable progress records — the unit of resumability.
//!
//! Three record kinds are persisted per run:
//! - `RunRecord` — one row per pipeline execution
//! - `StepProgressRecord` — one row per `(run_id, step_number)`
//! - `ItemRecord` — one row per fan-out work item inside a step
//!
//! Records are created when work begins, mutated continuously while it
//! executes, and never deleted. Storage lives in [`store`]; declared-output
//! verification lives in [`verify`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod store;
pub mod verify;

pub use store::{CheckpointStore, FileCheckpointStore};

/// Reserved item key for all-or-nothing steps. A step whose handler plans no
/// items runs exactly one unit of work under this key.
pub const SENTINEL_KEY: &str = "_step";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Fresh,
    Resume,
}

/// One end-to-end pipeline execution. Mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Refreshed by workers after every item; staleness detection compares
    /// this against the configured threshold.
    pub heartbeat_at: DateTime<Utc>,
    pub total_runtime_secs: Option<f64>,
    pub slowest_step: Option<u32>,
    pub failure_step: Option<u32>,
    /// Lowest non-completed step at the moment a stale run was recovered.
    /// Set only by the stale-recovery path.
    pub recovery_step: Option<u32>,
}

impl RunRecord {
    pub fn new(pipeline_name: &str, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            pipeline_name: pipeline_name.to_string(),
            status: RunStatus::Pending,
            mode,
            started_at: now,
            finished_at: None,
            heartbeat_at: now,
            total_runtime_secs: None,
            slowest_step: None,
            failure_step: None,
            recovery_step: None,
        }
    }

    /// Whether the run's heartbeat is older than `stale_after` seconds.
    pub fn is_stale(&self, stale_after_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.heartbeat_at);
        age.num_seconds() >= stale_after_secs as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Row-level metrics reported by step handlers through the heartbeat
/// contract. Cumulative per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMetrics {
    pub read: u64,
    pub processed: u64,
    pub inserted: u64,
    pub rejected: u64,
}

impl RowMetrics {
    pub fn accumulate(&mut self, other: &RowMetrics) {
        self.read += other.read;
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.rejected += other.rejected;
    }
}

/// Durable progress of one step within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgressRecord {
    pub run_id: String,
    pub step_number: u32,
    pub step_name: String,
    pub status: StepStatus,
    /// Number of times the step was re-entered (resume after crash or stale
    /// recovery), not item-level attempts.
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metrics: RowMetrics,
}

impl StepProgressRecord {
    pub fn new(run_id: &str, step_number: u32, step_name: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_number,
            step_name: step_name.to_string(),
            status: StepStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            duration_secs: None,
            error_message: None,
            metrics: RowMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InProgress,
    Done,
    Requeued,
    Exhausted,
}

impl ItemState {
    /// Done items are never revisited; everything else is eligible input for
    /// the next pass.
    pub fn is_incomplete(&self) -> bool {
        !matches!(self, ItemState::Done)
    }
}

/// Durable progress of one fan-out work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_key: String,
    pub state: ItemState,
    /// Attempts within the current loop pass; reset to 0 on requeue.
    pub attempt_count: u32,
    /// Completed loop passes; monotonic, capped by `max_loops`.
    pub loop_count: u32,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ItemRecord {
    pub fn pending(item_key: &str) -> Self {
        Self {
            item_key: item_key.to_string(),
            state: ItemState::Pending,
            attempt_count: 0,
            loop_count: 0,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}
