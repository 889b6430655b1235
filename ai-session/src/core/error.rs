//! Typed error taxonomy for the session backend.

/// Errors returned by [`crate::backend::SessionBackend`] and the session
/// lifecycle it supervises.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias used throughout the session backend.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
