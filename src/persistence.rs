//! Thin orchestration over `ai_session::persistence`: keeps the on-disk
//! session store and the live `SessionBackend` in lock-step, and rewires a
//! restored session's exit hook onto the Event Bus so a crash of a restored
//! session is noticed just like one created this run.
//!
//! Grounded on `ai_session::persistence::SessionStore`'s register/unregister/
//! save/restore cycle (§4.9); this module adds no persistence logic of its
//! own, only the cross-crate wiring `SessionStore` can't do on its own since
//! it has no knowledge of the Event Bus.

use std::sync::Arc;

use ai_session::{SessionBackend, SessionOptions, SessionStore};

use crate::error::CrewlyError;
use crate::event_bus::EventBus;

pub struct StatePersistence {
    store: Arc<SessionStore>,
    backend: Arc<SessionBackend>,
    event_bus: Arc<EventBus>,
}

impl StatePersistence {
    pub fn new(store: Arc<SessionStore>, backend: Arc<SessionBackend>, event_bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            backend,
            event_bus,
        })
    }

    /// Recreate every persisted session in the backend and subscribe each
    /// one to the Event Bus's `pty_exit` hook. Returns the number restored.
    pub async fn restore(&self) -> Result<usize, CrewlyError> {
        let restored = self.store.restore_state(&self.backend).await?;
        for name in self.backend.list() {
            if self.store.is_restored_session(&name) {
                if let Some(session) = self.backend.get(&name) {
                    self.event_bus.register_pty_session(session, None, None).await;
                }
            }
        }
        Ok(restored)
    }

    pub fn is_restored_session(&self, name: &str) -> bool {
        self.store.is_restored_session(name)
    }

    /// Record metadata for a newly created session and auto-save.
    pub fn register(&self, name: &str, options: &SessionOptions) -> Result<(), CrewlyError> {
        Ok(self.store.register_session(name, options)?)
    }

    /// Remove a session's metadata, auto-save, and cancel its pending
    /// debounced events.
    pub async fn unregister(&self, name: &str) -> Result<(), CrewlyError> {
        self.event_bus.unregister_session(name).await;
        Ok(self.store.unregister_session(name)?)
    }

    pub fn update_session_id(&self, name: &str, external_session_id: &str) -> Result<(), CrewlyError> {
        Ok(self.store.update_session_id(name, external_session_id)?)
    }

    /// `saveState -> destroy all sessions`, the first half of the shutdown
    /// sequence (§5); flushing logs and exiting is main's job.
    pub async fn shutdown(&self) -> Result<(), CrewlyError> {
        self.store.save_state()?;
        self.backend.destroy().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_session::RuntimeType;
    use std::time::Duration;

    fn opts() -> SessionOptions {
        let mut o = SessionOptions::new(".", "sh", RuntimeType::ClaudeCode);
        o.args = vec!["-c".to_string(), "sleep 30".to_string()];
        o
    }

    #[tokio::test]
    async fn restore_recreates_session_and_registers_exit_hook() {
        let dir = tempfile::tempdir().unwrap();
        let seed_store = Arc::new(SessionStore::at_path(dir.path().join("state.json")));
        seed_store.register_session("orc", &opts()).unwrap();

        let backend = Arc::new(SessionBackend::new());
        let event_bus = EventBus::new(Duration::from_millis(50), Duration::from_millis(100));
        let store = Arc::new(SessionStore::at_path(dir.path().join("state.json")));
        let persistence = StatePersistence::new(store, backend.clone(), event_bus);

        let restored = persistence.restore().await.unwrap();
        assert_eq!(restored, 1);
        assert!(persistence.is_restored_session("orc"));
        backend.kill("orc").await.unwrap();
    }

    #[tokio::test]
    async fn register_then_shutdown_saves_and_destroys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::at_path(dir.path().join("state.json")));
        let backend = Arc::new(SessionBackend::new());
        let event_bus = EventBus::new(Duration::from_millis(50), Duration::from_millis(100));
        let persistence = StatePersistence::new(store, backend.clone(), event_bus);

        backend.create("dev-1", opts()).await.unwrap();
        persistence.register("dev-1", &opts()).unwrap();

        persistence.shutdown().await.unwrap();
        assert_eq!(backend.count(), 0);
    }
}
