//! Reference session factories.
//!
//! `ProcessSessionFactory` spawns one long-lived driver process per session
//! (a browser driver, an automation sidecar) and uses its PID as the
//! liveness token. `NullSessionFactory` issues no-op sessions for pipelines
//! whose steps need none; it is also the test double.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Session, SessionFactory};
use crate::errors::WorkError;

pub struct ProcessSession {
    pid: u32,
    child: Mutex<Child>,
}

impl Session for ProcessSession {
    fn liveness_token(&self) -> String {
        format!("pid:{}", self.pid)
    }

    fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }
}

/// Spawns a configured driver command per session. The child is marked
/// kill-on-drop so a dropped session cannot outlive the pool even when the
/// graceful path is skipped.
pub struct ProcessSessionFactory {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ProcessSessionFactory {
    pub fn new(command: &str, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir,
        }
    }
}

#[async_trait]
impl SessionFactory for ProcessSessionFactory {
    async fn create(&self) -> Result<Box<dyn Session>, WorkError> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkError::Fatal(format!("failed to spawn session driver: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| WorkError::SessionCrashed("driver exited during spawn".into()))?;
        debug!(pid, command = %self.command, "session driver spawned");

        Ok(Box::new(ProcessSession {
            pid,
            child: Mutex::new(child),
        }))
    }

    async fn destroy(&self, session: Box<dyn Session>) -> Result<(), WorkError> {
        let token = session.liveness_token();
        // SIGTERM first for a graceful driver exit; kill-on-drop delivers
        // SIGKILL when the Child is released below.
        if let Err(e) = signal_by_token(&token, "-TERM").await {
            warn!(token = %token, error = %e, "graceful terminate failed");
        }
        drop(session);
        Ok(())
    }

    async fn reap(&self, token: &str) -> Result<(), WorkError> {
        signal_by_token(token, "-KILL").await
    }
}

/// Send a signal to a `pid:<n>` token via the platform kill command. Used
/// for sessions we no longer hold a `Child` for (orphans from a previous
/// process).
async fn signal_by_token(token: &str, signal: &str) -> Result<(), WorkError> {
    let pid = token
        .strip_prefix("pid:")
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| WorkError::Fatal(format!("malformed liveness token '{token}'")))?;

    let status = Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .status()
        .await
        .map_err(|e| WorkError::Transient(format!("kill {pid} failed to run: {e}")))?;

    // A missing process is success for our purposes: the orphan is gone.
    let _ = status;
    Ok(())
}

/// No-op sessions for pipelines whose steps carry their own connectivity.
pub struct NullSessionFactory;

struct NullSession {
    token: String,
}

impl Session for NullSession {
    fn liveness_token(&self) -> String {
        self.token.clone()
    }

    fn is_alive(&self) -> bool {
        true
    }
}

#[async_trait]
impl SessionFactory for NullSessionFactory {
    async fn create(&self) -> Result<Box<dyn Session>, WorkError> {
        Ok(Box::new(NullSession {
            token: format!("null:{}", Uuid::new_v4().simple()),
        }))
    }

    async fn destroy(&self, _session: Box<dyn Session>) -> Result<(), WorkError> {
        Ok(())
    }
}
