//! Typed error hierarchy for the Trawler orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `WorkError` — failure taxonomy for work executed inside a step
//! - `StoreError` — checkpoint persistence failures
//! - `OrchestratorError` — run-level failures and preflight rejections

use thiserror::Error;

/// Failure taxonomy for a unit of work executed by a step handler.
///
/// The retry scheduler only ever sees this type: `is_retryable` decides
/// whether the RETRY/LOOP machinery applies, `is_session_crash` decides
/// whether the worker's session must be recycled first.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("network timeout after {elapsed_ms}ms: {context}")]
    NetworkTimeout { context: String, elapsed_ms: u64 },

    #[error("session crashed: {0}")]
    SessionCrashed(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("session pool exhausted after waiting {waited_ms}ms")]
    ResourceExhausted { waited_ms: u64 },

    #[error("output verification failed: {0}")]
    VerificationFailed(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkError {
    /// Whether the retry scheduler may service this failure again.
    /// `VerificationFailed` and `Fatal` are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkError::NetworkTimeout { .. }
                | WorkError::SessionCrashed(_)
                | WorkError::Transient(_)
                | WorkError::ResourceExhausted { .. }
        )
    }

    /// Whether the failure invalidated the worker's session.
    pub fn is_session_crash(&self) -> bool {
        matches!(self, WorkError::SessionCrashed(_))
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {path}: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("run {0} not found")]
    RunNotFound(String),
}

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("pipeline '{0}' already has an active run")]
    RunAlreadyActive(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("step {step} failed: {message}")]
    StepFailed { step: u32, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Process exit code for the CLI surface.
    ///
    /// 1 = a step failed fatally after a run started, 2 = preflight or
    /// configuration rejection before any run state was touched.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::RunAlreadyActive(_)
            | OrchestratorError::RunNotFound(_)
            | OrchestratorError::InvalidPipeline(_) => 2,
            OrchestratorError::StepFailed { .. }
            | OrchestratorError::Store(_)
            | OrchestratorError::Other(_) => 1,
        }
    }
}
