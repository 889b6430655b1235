//! Headless (non-PTY) child-process management, used as a fallback when the
//! host refuses to allocate a pseudo-terminal (sandboxed CI, containers
//! without `/dev/ptmx`, etc).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

/// Cap on the buffered-but-unread output, to bound memory if nobody drains it.
const MAX_BUFFERED_BYTES: usize = 1_048_576;

type OutputBuffer = Arc<Mutex<Vec<u8>>>;

/// Headless handle that mimics [`super::pty::PtyHandle`]'s interface over
/// piped stdio instead of a real pty.
pub struct HeadlessHandle {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    output: OutputBuffer,
    child: Arc<Mutex<Child>>,
}

impl HeadlessHandle {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: &Path,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .env("TERM", "xterm-256color")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{command}` headlessly"))?;

        let stdin = child.stdin.take().context("missing child stdin")?;
        let stdout = child.stdout.take().context("missing child stdout")?;
        let stderr = child.stderr.take().context("missing child stderr")?;

        let output = Arc::new(Mutex::new(Vec::new()));
        spawn_output_task(stdout, output.clone());
        spawn_output_task(stderr, output.clone());

        Ok(Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
            output,
            child: Arc::new(Mutex::new(child)),
        })
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            stdin.write_all(data).await?;
            stdin.flush().await?;
            Ok(())
        } else {
            Err(anyhow::anyhow!("headless child stdin closed"))
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut buffer = self.output.lock().await;
        if buffer.is_empty() {
            return Ok(Vec::new());
        }
        Ok(std::mem::take(&mut *buffer))
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }

    pub async fn try_wait(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().await;
        Ok(child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    pub async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn spawn_output_task<R>(mut reader: R, output: OutputBuffer)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut out = output.lock().await;
                    out.extend_from_slice(&buf[..n]);
                    if out.len() > MAX_BUFFERED_BYTES {
                        let drop_n = out.len() - MAX_BUFFERED_BYTES;
                        out.drain(..drop_n);
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "headless output read error");
                    break;
                }
            }
        }
    });
}
