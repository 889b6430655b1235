//! Unified handle over the two transports a [`crate::session::Session`] can
//! run its child process under.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use super::headless::HeadlessHandle;
use super::pty::PtyHandle;

/// A running child process, either under a real pty or (fallback) piped
/// stdio.
pub enum TerminalHandle {
    Pty(PtyHandle),
    Headless(HeadlessHandle),
}

impl TerminalHandle {
    /// Try to allocate a pty first; fall back to headless piping if the host
    /// refuses (commonly `EPERM`/`ENOENT` on `/dev/ptmx` in sandboxes).
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: &Path,
        rows: u16,
        cols: u16,
    ) -> Result<Self> {
        match PtyHandle::spawn(command, args, env, cwd, rows, cols) {
            Ok(pty) => Ok(Self::Pty(pty)),
            Err(err) => {
                tracing::warn!(%err, "pty allocation failed, falling back to headless transport");
                let headless = HeadlessHandle::spawn(command, args, env, cwd).await?;
                Ok(Self::Headless(headless))
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match self {
            Self::Pty(pty) => pty.write(data).await,
            Self::Headless(h) => h.write(data).await,
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            Self::Pty(pty) => pty.read().await,
            Self::Headless(h) => h.read().await,
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        match self {
            Self::Pty(pty) => pty.resize(rows, cols),
            // Headless transport has no geometry to reflow; resizing is a no-op.
            Self::Headless(_) => Ok(()),
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        match self {
            Self::Pty(pty) => pty.pid(),
            Self::Headless(h) => h.pid().await,
        }
    }

    /// Returns `Some(exit_code)` once the child has exited.
    pub async fn try_wait(&self) -> Result<Option<i32>> {
        match self {
            Self::Pty(pty) => pty.try_wait(),
            Self::Headless(h) => h.try_wait().await,
        }
    }

    pub async fn kill(&self) -> Result<()> {
        match self {
            Self::Pty(pty) => pty.kill(),
            Self::Headless(h) => h.kill().await,
        }
    }
}
