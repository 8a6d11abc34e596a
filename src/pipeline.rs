//! Pipeline definition and TOML loading.
//!
//! This module provides:
//! - `StepSpec` — the static description of one ordered step
//! - `StepHandler` — the interface site-specific step code implements
//! - `Pipeline` — specs coupled with their handlers, in declared order
//! - `PipelineFile` — the on-disk TOML format the CLI loads

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::WorkError;
use crate::runner::ProgressSink;
use crate::session::Session;

/// Static description of one pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Position in the pipeline; steps execute in ascending order.
    pub number: u32,
    /// Human-readable name of the step
    pub name: String,
    /// Glob patterns (relative to the data dir) that must match non-empty
    /// files for the step to count as complete.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Worker count override for this step; falls back to the global limit.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl StepSpec {
    pub fn new(number: u32, name: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            outputs: Vec::new(),
            concurrency: None,
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Evidence a handler produced something. The core never inspects the
/// content, only presence and non-emptiness, as part of completion
/// verification.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputDescriptor {
    /// A file expected on disk, non-empty.
    File(PathBuf),
    /// A row count; zero is empty.
    Rows(u64),
    /// An opaque token (export id, object key); blank is empty.
    Artifact(String),
}

impl OutputDescriptor {
    pub fn is_empty(&self) -> bool {
        match self {
            OutputDescriptor::File(path) => path
                .metadata()
                .map(|m| !m.is_file() || m.len() == 0)
                .unwrap_or(true),
            OutputDescriptor::Rows(n) => *n == 0,
            OutputDescriptor::Artifact(token) => token.trim().is_empty(),
        }
    }
}

/// The interface a concrete step implements. The orchestrator depends only
/// on this trait; selectors, extraction and translation all live behind it.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Item keys to fan out over. An empty plan makes this an
    /// all-or-nothing step executed once under the sentinel key.
    async fn plan(&self) -> Result<Vec<String>, WorkError> {
        Ok(Vec::new())
    }

    /// Execute one unit of work. Transient failures are routed through the
    /// retry scheduler; `Fatal` aborts the step.
    async fn execute(
        &self,
        item_key: &str,
        session: &mut dyn Session,
        progress: &ProgressSink,
    ) -> Result<Option<OutputDescriptor>, WorkError>;

    /// Fallback hook for items that spent their loop budget. The item stays
    /// `Exhausted` in the checkpoint either way.
    async fn on_exhausted(&self, item_key: &str) {
        let _ = item_key;
    }
}

/// One step: spec plus handler.
#[derive(Clone)]
pub struct PipelineStep {
    pub spec: StepSpec,
    pub handler: Arc<dyn StepHandler>,
}

/// An ordered pipeline for one source.
#[derive(Clone)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, spec: StepSpec, handler: Arc<dyn StepHandler>) -> Self {
        self.steps.push(PipelineStep { spec, handler });
        self
    }

    /// Preflight validation: at least one step, strictly ascending numbers.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("pipeline has no steps".to_string());
        }
        for pair in self.steps.windows(2) {
            if pair[1].spec.number <= pair[0].spec.number {
                return Err(format!(
                    "step numbers must be strictly ascending: {} then {}",
                    pair[0].spec.number, pair[1].spec.number
                ));
            }
        }
        Ok(())
    }

    pub fn get_step(&self, number: u32) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.spec.number == number)
    }
}

/// On-disk pipeline definition (`pipeline.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    pub name: String,
    #[serde(default)]
    pub limits: LimitsOverrides,
    #[serde(default)]
    pub session: Option<SessionCommand>,
    pub steps: Vec<StepEntry>,
}

/// Session driver command; absent means sessionless no-op sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One `[[steps]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub number: u32,
    pub name: String,
    /// Command run once per item; receives the item key and session token
    /// through the environment.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Explicit fan-out keys. Empty means an all-or-nothing step.
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// Partial limit overrides allowed in the pipeline file. Anything unset
/// falls back to the global defaults (see `config::Limits`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsOverrides {
    pub max_retries_timeout: Option<u32>,
    pub max_loops: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub retry_cap_ms: Option<u64>,
    pub max_instances: Option<usize>,
    pub acquire_timeout_secs: Option<u64>,
    pub recycle_threshold: Option<u64>,
    pub concurrency: Option<usize>,
    pub item_timeout_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub fail_on_exhausted: Option<bool>,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        let file: PipelineFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline TOML: {}", path.display()))?;
        Ok(file)
    }

    pub fn to_specs(&self) -> Vec<StepSpec> {
        self.steps
            .iter()
            .map(|entry| StepSpec {
                number: entry.number,
                name: entry.name.clone(),
                outputs: entry.outputs.clone(),
                concurrency: entry.concurrency,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    struct NoopHandler;

    #[async_trait]
    impl StepHandler for NoopHandler {
        async fn execute(
            &self,
            _item_key: &str,
            _session: &mut dyn Session,
            _progress: &ProgressSink,
        ) -> Result<Option<OutputDescriptor>, WorkError> {
            Ok(None)
        }
    }

    #[test]
    fn validate_rejects_empty_pipeline() {
        let pipeline = Pipeline::new("books");
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_order_steps() {
        let pipeline = Pipeline::new("books")
            .step(StepSpec::new(2, "b"), Arc::new(NoopHandler))
            .step(StepSpec::new(1, "a"), Arc::new(NoopHandler));
        let err = pipeline.validate().unwrap_err();
        assert!(err.contains("ascending"));
    }

    #[test]
    fn validate_accepts_gaps() {
        let pipeline = Pipeline::new("books")
            .step(StepSpec::new(1, "a"), Arc::new(NoopHandler))
            .step(StepSpec::new(5, "b"), Arc::new(NoopHandler));
        assert!(pipeline.validate().is_ok());
        assert!(pipeline.get_step(5).is_some());
        assert!(pipeline.get_step(3).is_none());
    }

    #[test]
    fn descriptor_emptiness() {
        assert!(OutputDescriptor::Rows(0).is_empty());
        assert!(!OutputDescriptor::Rows(12).is_empty());
        assert!(OutputDescriptor::Artifact("  ".into()).is_empty());
        assert!(!OutputDescriptor::Artifact("export-7".into()).is_empty());
        assert!(OutputDescriptor::File("/does/not/exist".into()).is_empty());

        let dir = tempdir().unwrap();
        let file = dir.path().join("rows.csv");
        fs::write(&file, "id\n1\n").unwrap();
        assert!(!OutputDescriptor::File(file).is_empty());
    }

    #[test]
    fn pipeline_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            r#"
name = "books"

[limits]
max_loops = 5

[session]
command = "drivers/chromium.sh"

[[steps]]
number = 1
name = "collect-listing"
command = "scrapers/books/listing.sh"
items = ["fiction", "travel"]
outputs = ["out/listing/*.jsonl"]
concurrency = 2

[[steps]]
number = 2
name = "export"
command = "scrapers/books/export.sh"
"#,
        )
        .unwrap();

        let file = PipelineFile::load(&path).unwrap();
        assert_eq!(file.name, "books");
        assert_eq!(file.limits.max_loops, Some(5));
        assert_eq!(file.session.as_ref().unwrap().command, "drivers/chromium.sh");
        assert_eq!(file.steps.len(), 2);
        assert_eq!(file.steps[0].items, vec!["fiction", "travel"]);
        assert!(file.steps[1].items.is_empty());

        let specs = file.to_specs();
        assert_eq!(specs[0].concurrency, Some(2));
        assert_eq!(specs[1].outputs.len(), 0);
    }

    #[test]
    fn pipeline_file_load_missing_errors() {
        let dir = tempdir().unwrap();
        let err = PipelineFile::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read pipeline file"));
    }
}
