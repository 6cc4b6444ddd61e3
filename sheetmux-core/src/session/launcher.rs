//! Spawning the per-session tool server.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use crate::config::{ChildSettings, FILES_ROOT_ENV};
use crate::error::SessionError;

/// The pipes of a freshly started child.
pub struct ChildIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// The OS process, when there is one. In-process children have none.
    pub process: Option<Child>,
}

/// Starts one child per session.
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    /// Start a child for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SpawnFailure` if the child cannot be started.
    async fn launch(&self, session_id: &str) -> Result<ChildIo, SessionError>;
}

/// Launches the configured command as an OS process.
///
/// Every child runs in `files_root`, receives `EXCEL_FILES_PATH`, and is
/// placed in its own process group so the whole tree can be signalled.
pub struct ProcessLauncher {
    settings: ChildSettings,
}

impl ProcessLauncher {
    pub fn new(settings: ChildSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ChildSettings {
        &self.settings
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn launch(&self, session_id: &str) -> Result<ChildIo, SessionError> {
        let spawn_failure = |reason: String| SessionError::SpawnFailure {
            session_id: session_id.to_string(),
            reason,
        };

        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&self.settings.args)
            .current_dir(&self.settings.files_root)
            .env(FILES_ROOT_ENV, &self.settings.files_root)
            .envs(self.settings.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            spawn_failure(format!("failed to spawn '{}': {e}", self.settings.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failure("child stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failure("child stdout was not piped".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, line = %line, "child stderr");
                }
            });
        }

        tracing::info!(
            session_id,
            pid = child.id(),
            command = %self.settings.command,
            "spawned child"
        );

        Ok(ChildIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Some(child),
        })
    }
}
