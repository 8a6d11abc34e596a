//! Run ledger — the contract surface for external monitoring.
//!
//! One JSONL file per pipeline, one line per run, mirroring the run record
//! plus step-level aggregates. Append-mostly: only the active run's row is
//! ever replaced, via an atomic rewrite of the file.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::store::write_atomic;
use crate::checkpoint::{RowMetrics, RunMode, RunRecord, RunStatus, StepProgressRecord, StepStatus};
use crate::errors::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_number: u32,
    pub step_name: String,
    pub status: StepStatus,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    pub metrics: RowMetrics,
}

impl From<&StepProgressRecord> for StepSummary {
    fn from(record: &StepProgressRecord) -> Self {
        Self {
            step_number: record.step_number,
            step_name: record.step_name.clone(),
            status: record.status,
            duration_secs: record.duration_secs,
            error_message: record.error_message.clone(),
            metrics: record.metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_runtime_secs: Option<f64>,
    pub slowest_step: Option<u32>,
    pub failure_step: Option<u32>,
    pub recovery_step: Option<u32>,
    pub steps: Vec<StepSummary>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_run(run: &RunRecord, steps: Vec<StepSummary>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            pipeline_name: run.pipeline_name.clone(),
            status: run.status,
            mode: run.mode,
            started_at: run.started_at,
            finished_at: run.finished_at,
            total_runtime_secs: run.total_runtime_secs,
            slowest_step: run.slowest_step,
            failure_step: run.failure_step,
            recovery_step: run.recovery_step,
            steps,
            updated_at: Utc::now(),
        }
    }
}

pub struct RunLedger {
    path: PathBuf,
}

impl RunLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Replace the entry for the run, or append one if it is new.
    pub fn upsert(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        match entries.iter_mut().find(|e| e.run_id == entry.run_id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }

        let mut body = String::new();
        for entry in &entries {
            body.push_str(&serde_json::to_string(entry).expect("ledger entries serialize"));
            body.push('\n');
        }
        write_atomic(&self.path, body.as_bytes())
    }

    /// All rows, oldest first. Unparseable lines are skipped rather than
    /// failing the read; the ledger is advisory, checkpoints are the
    /// source of truth.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn latest(&self) -> Result<Option<LedgerEntry>, StoreError> {
        let mut entries = self.entries()?;
        entries.sort_by_key(|e| e.started_at);
        Ok(entries.pop())
    }
}
