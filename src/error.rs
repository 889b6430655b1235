//! Error taxonomy for the orchestration layer, and the context-wrapping
//! helpers used at internal call sites that don't need a typed error.

use anyhow::{Context, Result};

/// Typed errors surfaced at subsystem boundaries. Internal helper plumbing
/// that doesn't need a caller-matchable variant uses `anyhow` instead.
#[derive(Debug, thiserror::Error)]
pub enum CrewlyError {
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("could not analyze output: {0}")]
    AnalysisError(String),

    #[error("failed to dispatch action for session {session}: {reason}")]
    DispatchError { session: String, reason: String },

    #[error("persistence failure: {0}")]
    PersistenceError(String),

    #[error("probe timed out for session {0}")]
    TimeoutExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ai_session::SessionError> for CrewlyError {
    fn from(err: ai_session::SessionError) -> Self {
        match err {
            ai_session::SessionError::AlreadyExists(name) => Self::AlreadyExists(name),
            ai_session::SessionError::NotFound(name) => Self::NotFound(name),
            ai_session::SessionError::SpawnFailed(reason) => Self::SpawnFailed(reason),
            other => Self::Other(other.into()),
        }
    }
}

/// The typed result shape every subsystem boundary returns, per the §7
/// propagation policy: a recorded outcome even on failure, never a bare
/// `Result` that a caller could swallow silently.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContinuationActionResult {
    pub success: bool,
    pub action: String,
    pub message: String,
    pub error: Option<String>,
}

impl ContinuationActionResult {
    pub fn ok(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            action: action.into(),
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(action: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            action: action.into(),
            message: "action failed".to_string(),
            error: Some(error.to_string()),
        }
    }
}

/// Extension trait for adding a standard "Failed to ..." context prefix.
pub trait ResultExt<T> {
    fn context_op(self, operation: &str) -> Result<T>;
    fn context_path(self, operation: &str, path: &std::path::Path) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, operation: &str) -> Result<T> {
        self.context(format!("failed to {operation}"))
    }

    fn context_path(self, operation: &str, path: &std::path::Path) -> Result<T> {
        self.context(format!("failed to {operation} at '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_error_text() {
        let result = ContinuationActionResult::failed("inject_prompt", "write refused");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("write refused"));
    }
}
