//! Start/stop orchestration for a session's child process.
//!
//! Kept as free functions (rather than methods on [`crate::session::Session`])
//! so the graceful-shutdown sequence — interrupt, wait, force-kill — can be
//! unit-tested against a bare [`TerminalHandle`] without the rest of the
//! session state machine.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use super::error::{SessionError, SessionResult};
use super::terminal::TerminalHandle;

/// Default grace period between an interrupt and a force-kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Spawn a new child process under the best available transport.
pub async fn start(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    cwd: &Path,
    rows: u16,
    cols: u16,
) -> SessionResult<TerminalHandle> {
    TerminalHandle::spawn(command, args, env, cwd, rows, cols)
        .await
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
}

/// Ask the child to exit (Ctrl-C over the transport), then escalate to a
/// hard kill if it hasn't exited within `grace`.
pub async fn stop(handle: &TerminalHandle, grace: Duration) -> SessionResult<()> {
    if handle.try_wait().await.map_err(to_session_error)?.is_some() {
        return Ok(());
    }

    // 0x03 is ETX (Ctrl-C); harmless to send to a headless child that
    // doesn't read stdin as a tty.
    let _ = handle.write(&[0x03]).await;

    let waited = timeout(grace, wait_for_exit(handle)).await;
    if waited.is_ok() {
        return Ok(());
    }

    handle.kill().await.map_err(to_session_error)
}

/// Unconditional hard kill, used when the caller doesn't want to wait.
pub async fn kill(handle: &TerminalHandle) -> SessionResult<()> {
    handle.kill().await.map_err(to_session_error)
}

async fn wait_for_exit(handle: &TerminalHandle) {
    loop {
        match handle.try_wait().await {
            Ok(Some(_)) => return,
            _ => sleep(Duration::from_millis(100)).await,
        }
    }
}

fn to_session_error(err: anyhow::Error) -> SessionError {
    SessionError::Other(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_a_real_process() {
        let handle = start(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &HashMap::new(),
            Path::new("."),
            24,
            80,
        )
        .await
        .unwrap();

        assert!(handle.try_wait().await.unwrap().is_none());
        stop(&handle, Duration::from_millis(200)).await.unwrap();
        assert!(handle.try_wait().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_on_already_exited_child_is_a_noop() {
        let handle = start(
            "sh",
            &["-c".to_string(), "exit 0".to_string()],
            &HashMap::new(),
            Path::new("."),
            24,
            80,
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(200)).await;
        stop(&handle, Duration::from_millis(200)).await.unwrap();
    }
}
