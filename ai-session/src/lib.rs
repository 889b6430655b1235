//! PTY-based session backend.
//!
//! `ai-session` owns one child process per named session under a
//! pseudo-terminal (falling back to piped stdio when a pty can't be
//! allocated), a bounded terminal buffer per session, and the on-disk
//! metadata persistence used to restore sessions after a restart. It is the
//! low-level half of the control plane; policy (when to nudge a session,
//! when to notify an operator) lives one layer up.

pub mod backend;
pub mod buffer;
pub mod core;
pub mod persistence;
pub mod session;

pub use backend::SessionBackend;
pub use buffer::TerminalBuffer;
pub use core::{validate_name, SessionError, SessionId, SessionResult, MAX_NAME_LEN};
pub use persistence::{AtomicFile, PersistedSessionInfo, PersistedState, SessionStore};
pub use session::{RuntimeType, Session, SessionOptions, SessionState};

/// Library version, exposed for diagnostics and the CLI's `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
