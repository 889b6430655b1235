//! Core session primitives: identity, typed errors, and the two process
//! transports (pty / headless) unified behind [`terminal::TerminalHandle`].

pub mod error;
pub mod headless;
pub mod ids;
pub mod lifecycle;
pub mod pty;
pub mod terminal;

pub use error::{SessionError, SessionResult};
pub use ids::{validate_name, SessionId, MAX_NAME_LEN};
pub use terminal::TerminalHandle;
