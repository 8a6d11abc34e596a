//! Checkpoint persistence.
//!
//! `CheckpointStore` is the single source of truth for resume decisions.
//! One canonical implementation exists per deployment target; here that is
//! `FileCheckpointStore`, a directory tree of JSON records under the state
//! directory:
//!
//! ```text
//! <state>/<pipeline>/runs/<run_id>/run.json
//! <state>/<pipeline>/runs/<run_id>/steps/step-02.json
//! <state>/<pipeline>/runs/<run_id>/items/step-02/<key>.json
//! ```
//!
//! Every write goes to a uniquely named temporary file first and is then
//! renamed over the target, so a reader (or a process killed mid-write)
//! never observes a partial record. Items write to distinct files, so
//! concurrent workers never touch each other's records.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use super::verify::verify_outputs;
use super::{ItemRecord, ItemState, RunRecord, RunStatus, StepProgressRecord, StepStatus};
use crate::errors::StoreError;

pub trait CheckpointStore: Send + Sync {
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    fn load_run(&self, run_id: &str) -> Result<RunRecord, StoreError>;
    fn latest_run(&self) -> Result<Option<RunRecord>, StoreError>;
    fn running_runs(&self) -> Result<Vec<RunRecord>, StoreError>;
    fn touch_heartbeat(&self, run_id: &str) -> Result<(), StoreError>;

    fn step_record(
        &self,
        run_id: &str,
        step: u32,
    ) -> Result<Option<StepProgressRecord>, StoreError>;
    fn step_status(&self, run_id: &str, step: u32) -> Result<StepStatus, StoreError>;
    fn save_step(&self, record: &StepProgressRecord) -> Result<(), StoreError>;
    fn mark_step_in_progress(
        &self,
        run_id: &str,
        step: u32,
        step_name: &str,
    ) -> Result<StepProgressRecord, StoreError>;
    /// Flip a step to `Completed`, but only after re-verifying its declared
    /// outputs. A handler that reported success without producing verifiable
    /// output is recorded `Failed` instead.
    fn mark_step_complete(
        &self,
        run_id: &str,
        step: u32,
        outputs: &[String],
        data_dir: &Path,
    ) -> Result<StepStatus, StoreError>;
    fn mark_step_failed(&self, run_id: &str, step: u32, error: &str) -> Result<(), StoreError>;
    fn mark_step_skipped(&self, run_id: &str, step: u32, step_name: &str)
    -> Result<(), StoreError>;
    /// Stale recovery: return every `InProgress` step to `Pending`. Item
    /// records are left untouched.
    fn reset_in_progress_steps(&self, run_id: &str) -> Result<Vec<u32>, StoreError>;
    /// Forced re-execution: return every item of one step to `Pending` with
    /// fresh attempt and loop counters. Used when a completed step fails
    /// output re-verification or is re-run via `--step`.
    fn reset_step_items(&self, run_id: &str, step: u32) -> Result<usize, StoreError>;

    fn upsert_item(&self, run_id: &str, step: u32, item: &ItemRecord) -> Result<(), StoreError>;
    fn list_items(&self, run_id: &str, step: u32) -> Result<Vec<ItemRecord>, StoreError>;
    fn list_incomplete_items(&self, run_id: &str, step: u32)
    -> Result<Vec<ItemRecord>, StoreError>;
}

pub struct FileCheckpointStore {
    root: PathBuf,
    // Serializes run.json writers (orchestrator status flips vs heartbeat
    // touches); step and item records have single writers by construction.
    run_write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) the store for one pipeline.
    pub fn open(state_dir: &Path, pipeline_name: &str) -> Result<Self, StoreError> {
        let root = state_dir.join(pipeline_name);
        let runs = root.join("runs");
        fs::create_dir_all(&runs).map_err(|source| StoreError::Write {
            path: runs.clone(),
            source,
        })?;
        Ok(Self {
            root,
            run_write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn step_path(&self, run_id: &str, step: u32) -> PathBuf {
        self.run_dir(run_id)
            .join("steps")
            .join(format!("step-{step:02}.json"))
    }

    fn items_dir(&self, run_id: &str, step: u32) -> PathBuf {
        self.run_dir(run_id)
            .join("items")
            .join(format!("step-{step:02}"))
    }

    fn item_path(&self, run_id: &str, step: u32, item_key: &str) -> PathBuf {
        self.items_dir(run_id, step)
            .join(format!("{}.json", item_file_stem(item_key)))
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let value = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(value))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(value).expect("record types serialize to JSON");
        write_atomic(path, json.as_bytes())
    }

    fn load_step_or_new(
        &self,
        run_id: &str,
        step: u32,
        step_name: &str,
    ) -> Result<StepProgressRecord, StoreError> {
        Ok(self
            .step_record(run_id, step)?
            .unwrap_or_else(|| StepProgressRecord::new(run_id, step, step_name)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let _guard = self.run_write_lock.lock().expect("run write lock");
        Self::write_json(&self.run_path(&run.run_id), run)
    }

    fn load_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        Self::read_json(&self.run_path(run_id))?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let runs_dir = self.root.join("runs");
        let entries = match fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: runs_dir,
                    source,
                });
            }
        };

        let mut latest: Option<RunRecord> = None;
        for entry in entries.flatten() {
            let run_path = entry.path().join("run.json");
            if let Some(run) = Self::read_json::<RunRecord>(&run_path)? {
                let newer = latest
                    .as_ref()
                    .is_none_or(|best| run.started_at > best.started_at);
                if newer {
                    latest = Some(run);
                }
            }
        }
        Ok(latest)
    }

    fn running_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let runs_dir = self.root.join("runs");
        let entries = match fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: runs_dir,
                    source,
                });
            }
        };

        let mut running = Vec::new();
        for entry in entries.flatten() {
            let run_path = entry.path().join("run.json");
            if let Some(run) = Self::read_json::<RunRecord>(&run_path)? {
                if run.status == RunStatus::Running {
                    running.push(run);
                }
            }
        }
        running.sort_by_key(|r| r.started_at);
        Ok(running)
    }

    fn touch_heartbeat(&self, run_id: &str) -> Result<(), StoreError> {
        let _guard = self.run_write_lock.lock().expect("run write lock");
        let mut run = Self::read_json::<RunRecord>(&self.run_path(run_id))?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        run.heartbeat_at = Utc::now();
        Self::write_json(&self.run_path(run_id), &run)
    }

    fn step_record(
        &self,
        run_id: &str,
        step: u32,
    ) -> Result<Option<StepProgressRecord>, StoreError> {
        Self::read_json(&self.step_path(run_id, step))
    }

    fn step_status(&self, run_id: &str, step: u32) -> Result<StepStatus, StoreError> {
        Ok(self
            .step_record(run_id, step)?
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending))
    }

    fn save_step(&self, record: &StepProgressRecord) -> Result<(), StoreError> {
        Self::write_json(&self.step_path(&record.run_id, record.step_number), record)
    }

    fn mark_step_in_progress(
        &self,
        run_id: &str,
        step: u32,
        step_name: &str,
    ) -> Result<StepProgressRecord, StoreError> {
        let mut record = self.load_step_or_new(run_id, step, step_name)?;
        if record.status == StepStatus::InProgress || record.status == StepStatus::Failed {
            record.retry_count += 1;
        }
        record.status = StepStatus::InProgress;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        record.completed_at = None;
        record.error_message = None;
        self.save_step(&record)?;
        Ok(record)
    }

    fn mark_step_complete(
        &self,
        run_id: &str,
        step: u32,
        outputs: &[String],
        data_dir: &Path,
    ) -> Result<StepStatus, StoreError> {
        let mut record = self.load_step_or_new(run_id, step, "")?;
        let now = Utc::now();
        record.completed_at = Some(now);
        record.duration_secs = record
            .started_at
            .map(|s| now.signed_duration_since(s).num_milliseconds() as f64 / 1000.0);

        match verify_outputs(data_dir, outputs) {
            Ok(()) => {
                record.status = StepStatus::Completed;
                record.error_message = None;
            }
            Err(detail) => {
                record.status = StepStatus::Failed;
                record.error_message = Some(format!("output verification failed: {detail}"));
            }
        }
        self.save_step(&record)?;
        Ok(record.status)
    }

    fn mark_step_failed(&self, run_id: &str, step: u32, error: &str) -> Result<(), StoreError> {
        let mut record = self.load_step_or_new(run_id, step, "")?;
        record.status = StepStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.duration_secs = record.started_at.zip(record.completed_at).map(|(s, c)| {
            c.signed_duration_since(s).num_milliseconds() as f64 / 1000.0
        });
        record.error_message = Some(error.to_string());
        self.save_step(&record)
    }

    fn mark_step_skipped(
        &self,
        run_id: &str,
        step: u32,
        step_name: &str,
    ) -> Result<(), StoreError> {
        let mut record = self.load_step_or_new(run_id, step, step_name)?;
        record.status = StepStatus::Skipped;
        self.save_step(&record)
    }

    fn reset_in_progress_steps(&self, run_id: &str) -> Result<Vec<u32>, StoreError> {
        let steps_dir = self.run_dir(run_id).join("steps");
        let entries = match fs::read_dir(&steps_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: steps_dir,
                    source,
                });
            }
        };

        let mut reset = Vec::new();
        for entry in entries.flatten() {
            if let Some(mut record) = Self::read_json::<StepProgressRecord>(&entry.path())? {
                if record.status == StepStatus::InProgress {
                    record.status = StepStatus::Pending;
                    self.save_step(&record)?;
                    reset.push(record.step_number);
                }
            }
        }
        reset.sort_unstable();
        Ok(reset)
    }

    fn reset_step_items(&self, run_id: &str, step: u32) -> Result<usize, StoreError> {
        let mut reset = 0;
        for mut item in self.list_items(run_id, step)? {
            if item.state == ItemState::Pending
                && item.attempt_count == 0
                && item.loop_count == 0
            {
                continue;
            }
            item.state = ItemState::Pending;
            item.attempt_count = 0;
            item.loop_count = 0;
            item.error_message = None;
            item.updated_at = Utc::now();
            self.upsert_item(run_id, step, &item)?;
            reset += 1;
        }
        Ok(reset)
    }

    fn upsert_item(&self, run_id: &str, step: u32, item: &ItemRecord) -> Result<(), StoreError> {
        Self::write_json(&self.item_path(run_id, step, &item.item_key), item)
    }

    fn list_items(&self, run_id: &str, step: u32) -> Result<Vec<ItemRecord>, StoreError> {
        let dir = self.items_dir(run_id, step);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Read { path: dir, source }),
        };

        let mut items = Vec::new();
        for entry in entries.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                if let Some(item) = Self::read_json::<ItemRecord>(&entry.path())? {
                    items.push(item);
                }
            }
        }
        items.sort_by(|a, b| a.item_key.cmp(&b.item_key));
        Ok(items)
    }

    fn list_incomplete_items(
        &self,
        run_id: &str,
        step: u32,
    ) -> Result<Vec<ItemRecord>, StoreError> {
        Ok(self
            .list_items(run_id, step)?
            .into_iter()
            .filter(|i| i.state.is_incomplete())
            .collect())
    }
}

/// Write via a uniquely named temp file in the same directory, then rename.
/// Rename is atomic on POSIX, so readers see either the old record or the
/// new one, never a torn write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().expect("record paths have a parent");
    fs::create_dir_all(parent).map_err(|source| StoreError::Write {
        path: parent.to_path_buf(),
        source,
    })?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
        Uuid::new_v4().simple()
    ));
    fs::write(&tmp, bytes).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// File stem for an item key: sanitized for the filesystem, suffixed with a
/// hash of the raw key so distinct keys never map to the same file.
fn item_file_stem(item_key: &str) -> String {
    let sanitized: String = item_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    let mut hasher = DefaultHasher::new();
    item_key.hash(&mut hasher);
    format!("{sanitized}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ItemState, RunMode};
    use tempfile::tempdir;

    fn make_store() -> (FileCheckpointStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "books").unwrap();
        (store, dir)
    }

    #[test]
    fn run_roundtrip_and_latest() {
        let (store, _dir) = make_store();
        assert!(store.latest_run().unwrap().is_none());

        let mut first = RunRecord::new("books", RunMode::Fresh);
        first.started_at = Utc::now() - chrono::Duration::seconds(60);
        store.save_run(&first).unwrap();

        let second = RunRecord::new("books", RunMode::Fresh);
        store.save_run(&second).unwrap();

        let loaded = store.load_run(&first.run_id).unwrap();
        assert_eq!(loaded.run_id, first.run_id);

        let latest = store.latest_run().unwrap().unwrap();
        assert_eq!(latest.run_id, second.run_id);
    }

    #[test]
    fn load_missing_run_is_not_found() {
        let (store, _dir) = make_store();
        match store.load_run("nope") {
            Err(StoreError::RunNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("Expected RunNotFound, got {other:?}"),
        }
    }

    #[test]
    fn running_runs_filters_by_status() {
        let (store, _dir) = make_store();
        let mut running = RunRecord::new("books", RunMode::Fresh);
        running.status = RunStatus::Running;
        store.save_run(&running).unwrap();

        let mut done = RunRecord::new("books", RunMode::Fresh);
        done.status = RunStatus::Completed;
        store.save_run(&done).unwrap();

        let found = store.running_runs().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].run_id, running.run_id);
    }

    #[test]
    fn touch_heartbeat_advances_timestamp() {
        let (store, _dir) = make_store();
        let mut run = RunRecord::new("books", RunMode::Fresh);
        run.heartbeat_at = Utc::now() - chrono::Duration::seconds(3600);
        store.save_run(&run).unwrap();

        store.touch_heartbeat(&run.run_id).unwrap();
        let loaded = store.load_run(&run.run_id).unwrap();
        assert!(loaded.heartbeat_at > run.heartbeat_at);
    }

    #[test]
    fn step_status_defaults_to_pending() {
        let (store, _dir) = make_store();
        assert_eq!(store.step_status("r1", 3).unwrap(), StepStatus::Pending);
    }

    #[test]
    fn mark_in_progress_then_reenter_counts_retries() {
        let (store, _dir) = make_store();
        let record = store.mark_step_in_progress("r1", 1, "collect").unwrap();
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.status, StepStatus::InProgress);

        let record = store.mark_step_in_progress("r1", 1, "collect").unwrap();
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn mark_complete_without_declared_outputs_completes() {
        let (store, dir) = make_store();
        store.mark_step_in_progress("r1", 1, "collect").unwrap();
        let status = store
            .mark_step_complete("r1", 1, &[], dir.path())
            .unwrap();
        assert_eq!(status, StepStatus::Completed);
        let record = store.step_record("r1", 1).unwrap().unwrap();
        assert!(record.duration_secs.is_some());
    }

    #[test]
    fn mark_complete_with_missing_outputs_records_failed() {
        let (store, dir) = make_store();
        store.mark_step_in_progress("r1", 1, "collect").unwrap();
        let status = store
            .mark_step_complete("r1", 1, &["out/*.csv".to_string()], dir.path())
            .unwrap();
        assert_eq!(status, StepStatus::Failed);
        let record = store.step_record("r1", 1).unwrap().unwrap();
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .contains("verification failed")
        );
    }

    #[test]
    fn mark_complete_with_present_outputs_completes() {
        let (store, dir) = make_store();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("rows.csv"), "id,price\n1,9.99\n").unwrap();

        store.mark_step_in_progress("r1", 1, "collect").unwrap();
        let status = store
            .mark_step_complete("r1", 1, &["out/*.csv".to_string()], dir.path())
            .unwrap();
        assert_eq!(status, StepStatus::Completed);
    }

    #[test]
    fn reset_in_progress_steps_leaves_items_alone() {
        let (store, _dir) = make_store();
        store.mark_step_in_progress("r1", 1, "a").unwrap();
        store.mark_step_in_progress("r1", 2, "b").unwrap();
        store
            .mark_step_complete("r1", 1, &[], Path::new("/"))
            .unwrap();
        store.upsert_item("r1", 2, &ItemRecord::pending("page-1")).unwrap();

        let reset = store.reset_in_progress_steps("r1").unwrap();
        assert_eq!(reset, vec![2]);
        assert_eq!(store.step_status("r1", 2).unwrap(), StepStatus::Pending);
        assert_eq!(store.step_status("r1", 1).unwrap(), StepStatus::Completed);
        assert_eq!(store.list_items("r1", 2).unwrap().len(), 1);
    }

    #[test]
    fn item_upsert_and_incomplete_listing() {
        let (store, _dir) = make_store();
        let mut a = ItemRecord::pending("page-1");
        store.upsert_item("r1", 2, &a).unwrap();
        let mut b = ItemRecord::pending("page-2");
        b.state = ItemState::Done;
        store.upsert_item("r1", 2, &b).unwrap();

        a.state = ItemState::Requeued;
        a.loop_count = 1;
        store.upsert_item("r1", 2, &a).unwrap();

        let all = store.list_items("r1", 2).unwrap();
        assert_eq!(all.len(), 2);

        let incomplete = store.list_incomplete_items("r1", 2).unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].item_key, "page-1");
        assert_eq!(incomplete[0].loop_count, 1);
    }

    #[test]
    fn reset_step_items_clears_states_and_counters() {
        let (store, _dir) = make_store();
        let mut done = ItemRecord::pending("page-1");
        done.state = ItemState::Done;
        done.attempt_count = 1;
        store.upsert_item("r1", 2, &done).unwrap();
        let mut spent = ItemRecord::pending("page-2");
        spent.state = ItemState::Exhausted;
        spent.loop_count = 3;
        spent.error_message = Some("gave up".into());
        store.upsert_item("r1", 2, &spent).unwrap();
        store.upsert_item("r1", 2, &ItemRecord::pending("page-3")).unwrap();

        let reset = store.reset_step_items("r1", 2).unwrap();
        assert_eq!(reset, 2);
        for item in store.list_items("r1", 2).unwrap() {
            assert_eq!(item.state, ItemState::Pending);
            assert_eq!(item.attempt_count, 0);
            assert_eq!(item.loop_count, 0);
            assert!(item.error_message.is_none());
        }
    }

    #[test]
    fn item_keys_with_awkward_characters_do_not_collide() {
        let (store, _dir) = make_store();
        store
            .upsert_item("r1", 1, &ItemRecord::pending("category/a b"))
            .unwrap();
        store
            .upsert_item("r1", 1, &ItemRecord::pending("category_a_b"))
            .unwrap();
        assert_eq!(store.list_items("r1", 1).unwrap().len(), 2);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (store, dir) = make_store();
        let run = RunRecord::new("books", RunMode::Fresh);
        store.save_run(&run).unwrap();
        store.save_run(&run).unwrap();

        let run_dir = dir.path().join("books/runs").join(&run.run_id);
        let leftovers: Vec<_> = fs::read_dir(&run_dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn reopen_reads_prior_state() {
        let dir = tempdir().unwrap();
        let run_id;
        {
            let store = FileCheckpointStore::open(dir.path(), "books").unwrap();
            let run = RunRecord::new("books", RunMode::Fresh);
            run_id = run.run_id.clone();
            store.save_run(&run).unwrap();
            store.mark_step_in_progress(&run_id, 1, "collect").unwrap();
        }
        {
            let store = FileCheckpointStore::open(dir.path(), "books").unwrap();
            assert!(store.load_run(&run_id).is_ok());
            assert_eq!(
                store.step_status(&run_id, 1).unwrap(),
                StepStatus::InProgress
            );
        }
    }
}
