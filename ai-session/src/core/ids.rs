//! Identity types.
//!
//! A [`Session`](crate::session::Session) is addressed by its human-assigned
//! `name` everywhere in the public API (per the control-plane contract,
//! operations are "by name"). `SessionId` is a secondary, internally-generated
//! identifier used only for structured logging and as a stable key that
//! survives a session being renamed-on-restore; it is never part of the
//! backend's lookup key.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a session name.
pub const MAX_NAME_LEN: usize = 50;

/// Validate a session name against `[A-Za-z0-9_-]+`, length <= 50.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!(
            "session name must be 1-{} characters, got {}",
            MAX_NAME_LEN,
            name.len()
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(format!(
            "session name '{name}' must match [A-Za-z0-9_-]+"
        ));
    }
    Ok(())
}

/// Internal unique session identifier, independent of the (mutable-by-
/// restore) human-readable name.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        assert!(validate_name("dev-1").is_ok());
        assert!(validate_name("orc_Main42").is_ok());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("has spaces").is_err());
        assert!(validate_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
