//! The registry of live sessions — the only path through which sessions are
//! created or destroyed, mirroring the teacher's `SessionManager` but keyed
//! by name rather than by [`crate::core::ids::SessionId`].

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::error::{SessionError, SessionResult};
use crate::session::{Session, SessionOptions};

/// Background output pump cadence; kept short since a read is non-blocking
/// on both transports.
const PUMP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// Directory of named sessions. Cheaply cloneable; intended to be held
/// behind a single `Arc` for the process lifetime.
#[derive(Clone, Default)]
pub struct SessionBackend {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl SessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a new session and register it. Fails `AlreadyExists` if the
    /// name is already registered; no entry is added on spawn failure.
    pub async fn create(&self, name: &str, options: SessionOptions) -> SessionResult<Arc<Session>> {
        if self.sessions.contains_key(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }

        let session = Arc::new(Session::spawn(name, options).await?);
        self.sessions.insert(name.to_string(), session.clone());
        spawn_pump(session.clone());
        Ok(session)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).map(|e| e.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Terminate and deregister a session. Idempotent: killing an unknown
    /// name is a no-op, matching the teacher's tolerant destroy semantics.
    pub async fn kill(&self, name: &str) -> SessionResult<()> {
        if let Some((_, session)) = self.sessions.remove(name) {
            session.kill().await?;
            session.buffer.dispose();
        }
        Ok(())
    }

    pub fn capture_output(&self, name: &str, lines: usize) -> String {
        match self.get(name) {
            Some(session) => session.buffer.get_content(lines),
            None => String::new(),
        }
    }

    pub fn get_terminal_buffer(&self, name: &str) -> SessionResult<Arc<Session>> {
        self.get(name).ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    pub fn get_raw_history(&self, name: &str) -> SessionResult<String> {
        let session = self.get(name).ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        Ok(session.buffer.get_history_as_string())
    }

    pub fn resize(&self, name: &str, rows: u16, cols: u16) -> SessionResult<()> {
        let session = self.get(name).ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        session.resize(rows, cols)
    }

    /// Kill every session. Idempotent: a second call finds nothing left to
    /// kill and returns cleanly.
    pub async fn destroy(&self) -> SessionResult<()> {
        let names: Vec<String> = self.list();
        for name in names {
            self.kill(&name).await?;
        }
        Ok(())
    }

    /// Like `destroy`, but also clears buffers immediately rather than
    /// relying on the graceful stop sequence — used on fatal shutdown paths
    /// where waiting out a grace period isn't acceptable.
    pub async fn force_destroy_all(&self) {
        for entry in self.sessions.iter() {
            let session = entry.value().clone();
            let _ = tokio::time::timeout(std::time::Duration::from_millis(500), session.kill()).await;
            session.buffer.dispose();
        }
        self.sessions.clear();
    }
}

fn spawn_pump(session: Arc<Session>) {
    tokio::spawn(async move {
        loop {
            if session.poll_exit().await.unwrap_or(None).is_some() {
                break;
            }
            match session.pump_once().await {
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(session = %session.name, %err, "pump read failed");
                    break;
                }
            }
            tokio::time::sleep(PUMP_INTERVAL).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RuntimeType;

    fn opts(command: &str, args: &[&str]) -> SessionOptions {
        let mut o = SessionOptions::new(".", command, RuntimeType::ClaudeCode);
        o.args = args.iter().map(|s| s.to_string()).collect();
        o
    }

    #[tokio::test]
    async fn create_then_exists_then_kill_then_not_exists() {
        let backend = SessionBackend::new();
        backend.create("dev-1", opts("sh", &["-c", "sleep 30"])).await.unwrap();
        assert!(backend.exists("dev-1"));
        backend.kill("dev-1").await.unwrap();
        assert!(!backend.exists("dev-1"));
    }

    #[tokio::test]
    async fn double_create_fails_already_exists() {
        let backend = SessionBackend::new();
        backend.create("dev-2", opts("sh", &["-c", "sleep 30"])).await.unwrap();
        let err = backend.create("dev-2", opts("sh", &["-c", "sleep 30"])).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
        backend.kill("dev-2").await.unwrap();
    }

    #[tokio::test]
    async fn kill_unknown_session_is_a_noop() {
        let backend = SessionBackend::new();
        backend.kill("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn resize_unknown_session_is_not_found() {
        let backend = SessionBackend::new();
        let err = backend.resize("ghost", 24, 80).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let backend = SessionBackend::new();
        backend.create("dev-3", opts("sh", &["-c", "sleep 30"])).await.unwrap();
        backend.destroy().await.unwrap();
        backend.destroy().await.unwrap();
        assert_eq!(backend.count(), 0);
    }
}
