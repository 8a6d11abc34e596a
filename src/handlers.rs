//! Reference step handler.
//!
//! `CommandStepHandler` is how scraper scripts plug into the CLI without
//! linking Rust code: one external command invocation per work item, with
//! the item key and session token injected through the environment. Exit
//! status maps onto the failure taxonomy: 0 is done, 75 (EX_TEMPFAIL)
//! is transient, anything else is fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::WorkError;
use crate::pipeline::{OutputDescriptor, Pipeline, PipelineFile, StepHandler, StepSpec};
use crate::runner::ProgressSink;
use crate::session::Session;

/// sysexits.h EX_TEMPFAIL, the conventional "try again later" status.
const EX_TEMPFAIL: i32 = 75;

pub struct CommandStepHandler {
    step_name: String,
    command: String,
    args: Vec<String>,
    items: Vec<String>,
    working_dir: PathBuf,
}

impl CommandStepHandler {
    pub fn new(
        step_name: &str,
        command: &str,
        args: Vec<String>,
        items: Vec<String>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            step_name: step_name.to_string(),
            command: command.to_string(),
            args,
            items,
            working_dir,
        }
    }
}

#[async_trait]
impl StepHandler for CommandStepHandler {
    async fn plan(&self) -> Result<Vec<String>, WorkError> {
        Ok(self.items.clone())
    }

    async fn execute(
        &self,
        item_key: &str,
        session: &mut dyn Session,
        progress: &ProgressSink,
    ) -> Result<Option<OutputDescriptor>, WorkError> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .env("TRAWLER_ITEM", item_key)
            .env("TRAWLER_STEP", &self.step_name)
            .env("TRAWLER_SESSION", session.liveness_token())
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|e| WorkError::Fatal(format!("failed to spawn step command: {e}")))?;

        match output.status.code() {
            Some(0) => {
                debug!(step = %self.step_name, item = item_key, "step command succeeded");
                progress.report_progress(0, 1, 0, 0);
                Ok(None)
            }
            Some(EX_TEMPFAIL) => Err(WorkError::Transient(format!(
                "step command asked for retry: {}",
                stderr_tail(&output.stderr)
            ))),
            Some(code) => Err(WorkError::Fatal(format!(
                "step command exited {code}: {}",
                stderr_tail(&output.stderr)
            ))),
            // Killed by a signal; worth another try.
            None => Err(WorkError::Transient(
                "step command killed by signal".to_string(),
            )),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let tail: String = trimmed
        .chars()
        .rev()
        .take(200)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if tail.is_empty() {
        "(no stderr)".to_string()
    } else {
        tail
    }
}

/// Couple a loaded pipeline file with command handlers.
pub fn build_pipeline(file: &PipelineFile, working_dir: &Path) -> Pipeline {
    let mut pipeline = Pipeline::new(&file.name);
    for entry in &file.steps {
        let spec = StepSpec {
            number: entry.number,
            name: entry.name.clone(),
            outputs: entry.outputs.clone(),
            concurrency: entry.concurrency,
        };
        let handler = CommandStepHandler::new(
            &entry.name,
            &entry.command,
            entry.args.clone(),
            entry.items.clone(),
            working_dir.to_path_buf(),
        );
        pipeline = pipeline.step(spec, Arc::new(handler));
    }
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, FileCheckpointStore, StepProgressRecord};
    use crate::session::{NullSessionFactory, SessionFactory};
    use tempfile::tempdir;

    async fn sink_and_session() -> (ProgressSink, Box<dyn Session>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::open(dir.path(), "books").unwrap());
        let record = StepProgressRecord::new("run-1", 1, "collect");
        let sink = ProgressSink::new(store as Arc<dyn CheckpointStore>, record);
        let session = NullSessionFactory.create().await.unwrap();
        (sink, session, dir)
    }

    fn shell(step: &str, script: &str, items: Vec<String>) -> CommandStepHandler {
        CommandStepHandler::new(
            step,
            "sh",
            vec!["-c".to_string(), script.to_string()],
            items,
            std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn exit_zero_is_done() {
        let (sink, mut session, _dir) = sink_and_session().await;
        let handler = shell("collect", "exit 0", Vec::new());
        let result = handler.execute("page-1", session.as_mut(), &sink).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn tempfail_exit_is_transient() {
        let (sink, mut session, _dir) = sink_and_session().await;
        let handler = shell("collect", "echo 'rate limited' >&2; exit 75", Vec::new());
        match handler.execute("page-1", session.as_mut(), &sink).await {
            Err(WorkError::Transient(message)) => assert!(message.contains("rate limited")),
            other => panic!("Expected Transient, got {other:?}", other = other.err()),
        }
    }

    #[tokio::test]
    async fn other_exit_codes_are_fatal() {
        let (sink, mut session, _dir) = sink_and_session().await;
        let handler = shell("collect", "echo 'selector missing' >&2; exit 3", Vec::new());
        match handler.execute("page-1", session.as_mut(), &sink).await {
            Err(WorkError::Fatal(message)) => {
                assert!(message.contains("exited 3"));
                assert!(message.contains("selector missing"));
            }
            other => panic!("Expected Fatal, got {other:?}", other = other.err()),
        }
    }

    #[tokio::test]
    async fn item_key_reaches_the_command_environment() {
        let (sink, mut session, _dir) = sink_and_session().await;
        let handler = shell(
            "collect",
            r#"test "$TRAWLER_ITEM" = "page-7" || exit 3"#,
            Vec::new(),
        );
        let result = handler.execute("page-7", session.as_mut(), &sink).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn plan_returns_configured_items() {
        let handler = shell("collect", "exit 0", vec!["a".into(), "b".into()]);
        assert_eq!(handler.plan().await.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn build_pipeline_wires_specs_and_handlers() {
        let file = PipelineFile {
            name: "books".into(),
            limits: Default::default(),
            session: None,
            steps: vec![crate::pipeline::StepEntry {
                number: 1,
                name: "collect".into(),
                command: "scrapers/collect.sh".into(),
                args: Vec::new(),
                items: vec!["fiction".into()],
                outputs: vec!["out/*.jsonl".into()],
                concurrency: Some(2),
            }],
        };
        let pipeline = build_pipeline(&file, Path::new("/tmp"));
        assert_eq!(pipeline.name, "books");
        assert_eq!(pipeline.steps.len(), 1);
        assert_eq!(pipeline.steps[0].spec.concurrency, Some(2));
        assert!(pipeline.validate().is_ok());
    }
}
