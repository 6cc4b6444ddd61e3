//! Graceful stop sequence for a session's child process.

use std::time::Duration;

/// Grace periods for stopping a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Time to wait after closing stdin before sending SIGTERM.
    pub stdin_close_grace: Duration,
    /// Time to wait after SIGTERM before sending SIGKILL.
    pub sigterm_grace: Duration,
}

impl Default for ShutdownRequest {
    fn default() -> Self {
        Self {
            stdin_close_grace: Duration::from_secs(5),
            sigterm_grace: Duration::from_secs(2),
        }
    }
}

/// Stop a child whose stdin has already been closed.
///
/// 1. Wait `stdin_close_grace` for the child to exit on EOF
/// 2. Send SIGTERM to its process group (Unix)
/// 3. Wait `sigterm_grace`
/// 4. Send SIGKILL
/// 5. Reap via `wait()` so no zombie is left behind
///
/// Returns the exit code, or `None` when the child was killed by a signal.
pub async fn shutdown_child(
    session_id: &str,
    child: &mut tokio::process::Child,
    request: &ShutdownRequest,
) -> std::io::Result<Option<i32>> {
    let pid = child.id();

    match tokio::time::timeout(request.stdin_close_grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(session_id, pid, code = status.code(), "child exited after stdin close");
            return Ok(status.code());
        }
        Ok(Err(e)) => {
            tracing::warn!(session_id, pid, error = %e, "wait failed after stdin close");
        }
        Err(_) => {
            tracing::info!(session_id, pid, "child did not exit within stdin_close_grace");
        }
    }

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => tracing::info!(session_id, pid, "sent SIGTERM to child process group"),
                // Group already gone between the wait above and now.
                Err(Errno::ESRCH) => {
                    tracing::debug!(session_id, pid, "child process group already exited")
                }
                Err(e) => tracing::warn!(session_id, pid, error = ?e, "killpg SIGTERM failed"),
            }
        }
    }

    match tokio::time::timeout(request.sigterm_grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(session_id, pid, code = status.code(), "child exited after SIGTERM");
            return Ok(status.code());
        }
        Ok(Err(e)) => {
            tracing::warn!(session_id, pid, error = %e, "wait failed after SIGTERM");
        }
        Err(_) => {
            tracing::warn!(session_id, pid, "child did not exit within sigterm_grace, sending SIGKILL");
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(session_id, pid, error = %e, "SIGKILL failed");
    }

    let status = child.wait().await?;
    tracing::info!(session_id, pid, code = status.code(), "child exited after SIGKILL");
    Ok(status.code())
}

/// SIGKILL a child's whole process group without waiting.
///
/// For exits that skip [`shutdown_child`]: children lead their own groups, so
/// nothing else reaches them once this process is gone.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = ?e, "killpg SIGKILL failed"),
    }
}
