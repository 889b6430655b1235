//! A single supervised child process and its terminal buffer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::buffer::TerminalBuffer;
use crate::core::error::{SessionError, SessionResult};
use crate::core::ids::SessionId;
use crate::core::terminal::TerminalHandle;
use crate::core::{lifecycle, validate_name};

/// The AI runtime a session's command is expected to launch, carried purely
/// as metadata for restart-resume and downstream policy — the backend
/// itself never branches on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    ClaudeCode,
    GeminiCli,
    CodexCli,
}

/// Parameters for creating a new session, independent of where they came
/// from (a fresh `create` call or a restored persisted entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_size")]
    pub rows: u16,
    #[serde(default = "default_size")]
    pub cols: u16,
    pub runtime_type: RuntimeType,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub external_session_id: Option<String>,
}

fn default_size() -> u16 {
    24
}

impl SessionOptions {
    pub fn new(cwd: impl Into<PathBuf>, command: impl Into<String>, runtime_type: RuntimeType) -> Self {
        Self {
            cwd: cwd.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            rows: 24,
            cols: 80,
            runtime_type,
            role: None,
            team_id: None,
            member_id: None,
            external_session_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Exited,
}

/// A single child process under a pseudo-terminal (or the headless
/// fallback) paired with its terminal buffer.
///
/// `write` after `kill` is a documented no-op, never an error — callers that
/// race a kill shouldn't have to special-case it.
pub struct Session {
    pub name: String,
    pub id: SessionId,
    pub options: SessionOptions,
    terminal: TerminalHandle,
    pub buffer: TerminalBuffer,
    state: RwLock<SessionState>,
    killed: AtomicBool,
    pid: AtomicI32,
    external_session_id: RwLock<Option<String>>,
    exit_tx: broadcast::Sender<Option<i32>>,
    data_tx: broadcast::Sender<Vec<u8>>,
}

impl Session {
    pub async fn spawn(name: &str, options: SessionOptions) -> SessionResult<Self> {
        validate_name(name).map_err(SessionError::SpawnFailed)?;

        let terminal = lifecycle::start(
            &options.command,
            &options.args,
            &options.env,
            &options.cwd,
            options.rows,
            options.cols,
        )
        .await?;

        let pid = terminal.pid().await.unwrap_or(0) as i32;
        let (exit_tx, _) = broadcast::channel(1);
        let (data_tx, _) = broadcast::channel(256);

        Ok(Self {
            name: name.to_string(),
            id: SessionId::new(),
            external_session_id: RwLock::new(options.external_session_id.clone()),
            buffer: TerminalBuffer::new(options.rows, options.cols),
            options,
            terminal,
            state: RwLock::new(SessionState::Running),
            killed: AtomicBool::new(false),
            pid: AtomicI32::new(pid),
            exit_tx,
            data_tx,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::Relaxed);
        if pid > 0 {
            Some(pid as u32)
        } else {
            None
        }
    }

    pub fn external_session_id(&self) -> Option<String> {
        self.external_session_id.read().unwrap().clone()
    }

    pub fn set_external_session_id(&self, id: impl Into<String>) {
        *self.external_session_id.write().unwrap() = Some(id.into());
    }

    /// Send bytes to the child's stdin. Returns `false` once the session has
    /// been killed, instead of erroring.
    pub async fn write(&self, data: &[u8]) -> SessionResult<bool> {
        if self.killed.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.terminal.write(data).await.map_err(SessionError::from)?;
        Ok(true)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> SessionResult<()> {
        self.terminal.resize(rows, cols).map_err(SessionError::from)?;
        self.buffer.resize(cols, rows);
        Ok(())
    }

    /// Poll the transport for newly-available output, feed it into the
    /// buffer, and fan it out to `onData` observers. Callers (the pump task
    /// owned by the backend) drive this in a loop; this method itself never
    /// blocks longer than a single read.
    pub async fn pump_once(&self) -> SessionResult<usize> {
        let data = self.terminal.read().await.map_err(SessionError::from)?;
        if data.is_empty() {
            return Ok(0);
        }
        self.buffer.write(&data);
        let _ = self.data_tx.send(data.clone());
        Ok(data.len())
    }

    /// Non-blocking check for child exit; transitions state and notifies
    /// `onExit` observers exactly once.
    pub async fn poll_exit(&self) -> SessionResult<Option<i32>> {
        let code = self.terminal.try_wait().await.map_err(SessionError::from)?;
        if let Some(code) = code {
            let mut state = self.state.write().unwrap();
            if *state != SessionState::Exited {
                *state = SessionState::Exited;
                let _ = self.exit_tx.send(Some(code));
            }
        }
        Ok(code)
    }

    /// Subscribe to this session's exit. Multiple observers supported; each
    /// gets its own receiver.
    pub fn on_exit(&self) -> broadcast::Receiver<Option<i32>> {
        self.exit_tx.subscribe()
    }

    /// Subscribe to this session's raw output stream, as fed by `pump_once`.
    /// Multiple observers supported; each gets its own receiver and only
    /// sees data sent after it subscribes.
    pub fn on_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.data_tx.subscribe()
    }

    /// Idempotent termination: subsequent calls after the first are no-ops.
    pub async fn kill(&self) -> SessionResult<()> {
        if self.killed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = lifecycle::stop(&self.terminal, Duration::from_secs(5)).await;
        *self.state.write().unwrap() = SessionState::Exited;
        let _ = self.exit_tx.send(None);
        result
    }
}
