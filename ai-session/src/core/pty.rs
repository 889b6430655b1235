//! PTY (pseudo-terminal) child-process management.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// Handle to a single child process running under a pseudo-terminal.
///
/// Owns the PTY master/slave pair and the spawned child exclusively; nothing
/// outside [`crate::session::Session`] is expected to hold a second handle to
/// the same child.
pub struct PtyHandle {
    size: Mutex<PtySize>,
    master: Box<dyn MasterPty + Send>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtyHandle {
    /// Spawn `command args…` inside a freshly allocated PTY of `rows x cols`.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: &Path,
        rows: u16,
        cols: u16,
    ) -> Result<Self> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .context("failed to allocate pseudo-terminal")?;

        let mut cmd = CommandBuilder::new(command);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn `{command}` in pty"))?;

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        Ok(Self {
            size: Mutex::new(size),
            master: pair.master,
            child: Mutex::new(child),
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    /// Write bytes to the child's stdin. Never blocks the async runtime for
    /// long: backpressure beyond the kernel pty buffer is the OS's problem.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = writer.lock().unwrap();
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Blocking read of whatever is currently available (non-blocking pty fd).
    /// Returns an empty vec if nothing is ready.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut reader = reader.lock().unwrap();
            let mut buf = vec![0u8; 8192];
            match reader.read(&mut buf) {
                Ok(0) => Ok(Vec::new()),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master.resize(size)?;
        *self.size.lock().unwrap() = size;
        Ok(())
    }

    pub fn size(&self) -> (u16, u16) {
        let size = self.size.lock().unwrap();
        (size.rows, size.cols)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().unwrap().process_id()
    }

    /// Non-blocking check of whether the child has exited. Returns the exit
    /// code when it has.
    pub fn try_wait(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().unwrap();
        match child.try_wait()? {
            Some(status) => Ok(Some(status.exit_code() as i32)),
            None => Ok(None),
        }
    }

    pub fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().unwrap();
        match child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()), // already exited
            Err(e) => Err(e.into()),
        }
    }
}
