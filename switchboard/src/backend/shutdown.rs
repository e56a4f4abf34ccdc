//! Graceful teardown for backend child processes.
//!
//! Escalation sequence: close stdin, wait a grace period for a clean exit,
//! SIGTERM the process group, wait again, SIGKILL, then reap the exit status
//! so no zombie is left behind.

use std::time::Duration;

use tokio::process::Child;

/// Grace periods for the teardown escalation.
#[derive(Debug, Clone)]
pub struct ShutdownGrace {
    /// Wait after closing stdin before sending SIGTERM.
    pub stdin_close: Duration,
    /// Wait after SIGTERM before sending SIGKILL.
    pub sigterm: Duration,
}

impl Default for ShutdownGrace {
    fn default() -> Self {
        Self {
            stdin_close: Duration::from_secs(3),
            sigterm: Duration::from_secs(2),
        }
    }
}

/// Tear down a child process. The caller must have closed the adapter's
/// stdin handle first; this function runs the wait/signal escalation and
/// always reaps the exit status.
pub(crate) async fn shutdown_child(backend_id: &str, child: &mut Child, grace: &ShutdownGrace) {
    // Fast path: child exits once its stdin closes.
    match tokio::time::timeout(grace.stdin_close, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(backend_id, ?status, "child exited after stdin close");
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(backend_id, error = %e, "wait failed after stdin close");
        }
        Err(_) => {
            tracing::debug!(backend_id, "child did not exit after stdin close");
        }
    }

    // SIGTERM the process group so grandchildren die too.
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            tracing::info!(backend_id, pid, "sending SIGTERM to process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(backend_id, pid, error = ?e, "killpg SIGTERM failed");
            }
        }
    }

    match tokio::time::timeout(grace.sigterm, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(backend_id, ?status, "child exited after SIGTERM");
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(backend_id, error = %e, "wait failed after SIGTERM");
        }
        Err(_) => {
            tracing::warn!(backend_id, "child did not exit after SIGTERM");
        }
    }

    // Last resort.
    if let Err(e) = child.kill().await {
        tracing::error!(backend_id, error = %e, "SIGKILL failed");
    }
    match child.wait().await {
        Ok(status) => tracing::info!(backend_id, ?status, "child exited after SIGKILL"),
        Err(e) => tracing::error!(backend_id, error = %e, "failed to reap child"),
    }
}
