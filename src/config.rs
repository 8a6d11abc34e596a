use anyhow::{Context, Result, anyhow};
use glob::glob;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::LimitsOverrides;
use crate::retry::RetryPolicy;
use crate::session::PoolConfig;

/// Tunables for retry, pooling, concurrency and staleness. Defaults are
/// overridable per pipeline file (`[limits]`) via [`Limits::apply`].
#[derive(Debug, Clone)]
pub struct Limits {
    /// RETRY budget per loop pass.
    pub max_retries_timeout: u32,
    /// LOOP budget per item.
    pub max_loops: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Session pool capacity.
    pub max_instances: usize,
    pub acquire_timeout_secs: u64,
    pub recycle_threshold: u64,
    /// Worker tasks per step, unless the step overrides it.
    pub concurrency: usize,
    /// Per-item handler deadline; expiry is a NetworkTimeout-class failure.
    pub item_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// A running run with no heartbeat for this long is stale.
    pub stale_after_secs: u64,
    /// How long in-flight items get to finish after a stop signal.
    pub shutdown_grace_secs: u64,
    /// Whether exhausted items fail the step, or leave it completed with
    /// the fallback path owning the losses.
    pub fail_on_exhausted: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_retries_timeout: 3,
            max_loops: 3,
            retry_base_ms: 500,
            retry_cap_ms: 30_000,
            max_instances: 4,
            acquire_timeout_secs: 60,
            recycle_threshold: 200,
            concurrency: 4,
            item_timeout_secs: 120,
            heartbeat_interval_secs: 15,
            stale_after_secs: 900,
            shutdown_grace_secs: 10,
            fail_on_exhausted: true,
        }
    }
}

impl Limits {
    pub fn apply(&mut self, overrides: &LimitsOverrides) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = overrides.$field {
                    self.$field = value;
                }
            };
        }
        take!(max_retries_timeout);
        take!(max_loops);
        take!(retry_base_ms);
        take!(retry_cap_ms);
        take!(max_instances);
        take!(acquire_timeout_secs);
        take!(recycle_threshold);
        take!(concurrency);
        take!(item_timeout_secs);
        take!(stale_after_secs);
        take!(fail_on_exhausted);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries_timeout,
            max_loops: self.max_loops,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_cap_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_instances: self.max_instances,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            recycle_threshold: self.recycle_threshold,
        }
    }
}

/// Runtime configuration for Trawler.
///
/// Bridges the pipeline file with the runtime needs of the orchestrator:
/// pipeline file discovery, state/data/log directory resolution and
/// creation.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub pipeline_file: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub limits: Limits,
    pub verbose: bool,
}

impl Config {
    pub fn new(
        project_dir: PathBuf,
        verbose: bool,
        pipeline_file: Option<PathBuf>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let pipeline_file = match pipeline_file {
            Some(path) => path
                .canonicalize()
                .context("Failed to resolve pipeline file path")?,
            None => Self::find_pipeline_file(&project_dir)?,
        };

        let state_dir = env_dir("TRAWLER_STATE_DIR")
            .unwrap_or_else(|| project_dir.join(".trawler/state"));
        let data_dir =
            env_dir("TRAWLER_DATA_DIR").unwrap_or_else(|| project_dir.join("data"));
        let log_dir = project_dir.join(".trawler/logs");

        Ok(Self {
            project_dir,
            pipeline_file,
            state_dir,
            data_dir,
            log_dir,
            limits: Limits::default(),
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Find a pipeline file, checking ./pipeline.toml first, then
    /// pipelines/*.toml. Returns the most recently modified file if
    /// multiple are found.
    fn find_pipeline_file(project_dir: &PathBuf) -> Result<PathBuf> {
        let default = project_dir.join("pipeline.toml");
        if default.exists() {
            return Ok(default);
        }

        let pattern = project_dir
            .join("pipelines/*.toml")
            .to_string_lossy()
            .to_string();

        let mut files: Vec<PathBuf> = glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .collect();

        if files.is_empty() {
            return Err(anyhow!(
                "No pipeline file found. Create pipeline.toml or provide --pipeline-file"
            ));
        }

        files.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        Ok(files.remove(0))
    }
}

/// Directory from the environment, with a leading `~/` expanded.
fn env_dir(var: &str) -> Option<PathBuf> {
    let value = std::env::var(var).ok()?;
    if let Some(rest) = value.strip_prefix("~/") {
        return dirs::home_dir().map(|home| home.join(rest));
    }
    Some(PathBuf::from(value))
}
