//! The process-wide collaborator registry: explicit `Arc`s passed to
//! whoever needs them, rather than the teacher's singleton-`static`
//! pattern (`getInstance`/`clearInstance`). Construction order matters —
//! each subsystem is handed the `Arc`s of the collaborators it depends on —
//! and teardown runs those same subsystems in reverse.
//!
//! Grounded on `orchestrator/mod.rs`'s `MasterClaude`, which holds `Arc`s to
//! its collaborators (coordination bus, worktree manager, quality judge)
//! constructed once at startup and threaded through rather than reached via
//! a global.

use std::sync::Arc;
use std::time::Duration;

use ai_session::{SessionBackend, SessionOptions, SessionStore};
use tokio::sync::broadcast;

use crate::activity::ActivityMonitor;
use crate::config::CrewlyConfig;
use crate::continuation::{ContinuationEngine, TaskService};
use crate::error::CrewlyError;
use crate::event_bus::EventBus;
use crate::notifications::NotificationRing;
use crate::persistence::StatePersistence;
use crate::scheduler::Scheduler;

/// Everything the control plane needs, wired once at process start and held
/// by the caller (typically `main`) for the life of the process.
pub struct CrewlyRuntime {
    pub config: CrewlyConfig,
    pub backend: Arc<SessionBackend>,
    pub event_bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub activity_monitor: Arc<ActivityMonitor>,
    pub continuation_engine: Arc<ContinuationEngine>,
    pub notifications: Arc<NotificationRing>,
    pub persistence: Arc<StatePersistence>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CrewlyRuntime {
    /// Construct every collaborator but start nothing yet; callers decide
    /// when background loops begin (after a successful `restore`, usually).
    pub fn bootstrap(config: CrewlyConfig, task_service: Option<Arc<dyn TaskService>>) -> Self {
        let backend = Arc::new(SessionBackend::new());
        let event_bus = EventBus::new(
            Duration::from_secs(config.debounce_secs),
            Duration::from_secs(config.dedup_secs),
        );
        let scheduler = Scheduler::new(backend.clone(), event_bus.clone(), config.scheduler.clone());
        let activity_monitor =
            ActivityMonitor::new(backend.clone(), event_bus.clone(), config.idle_consecutive_threshold);
        let notifications = NotificationRing::new(crate::notifications::DEFAULT_RING_CAP);
        let continuation_engine = ContinuationEngine::new(
            event_bus.clone(),
            backend.clone(),
            notifications.clone(),
            config.continuation.clone(),
            config.capture_lines,
            task_service,
        );
        let store = Arc::new(SessionStore::at_path(config.home_dir().join("session-state.json")));
        let persistence = StatePersistence::new(store, backend.clone(), event_bus.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            backend,
            event_bus,
            scheduler,
            activity_monitor,
            continuation_engine,
            notifications,
            persistence,
            shutdown_tx,
        }
    }

    /// Restore persisted sessions, then spawn the background loops (Event
    /// Bus timers are already running from `EventBus::new`). Returns the
    /// count of sessions restored, for the caller's cold-start/warm-restart
    /// distinction.
    pub async fn start(&self) -> Result<usize, CrewlyError> {
        let restored = self.persistence.restore().await?;

        self.continuation_engine.clone().start(self.shutdown_tx.subscribe());
        self.scheduler
            .clone()
            .start(Duration::from_secs(1), self.shutdown_tx.subscribe());
        self.activity_monitor.clone().start(
            Duration::from_secs(self.config.activity_sweep_secs),
            self.shutdown_tx.subscribe(),
        );

        Ok(restored)
    }

    /// Create a session through the backend and record it with both the
    /// Event Bus (exit hook) and the persistence layer (restart-resume),
    /// mirroring what a controller above this crate would do on every
    /// create call.
    pub async fn create_session(&self, name: &str, options: SessionOptions) -> Result<(), CrewlyError> {
        let session = self.backend.create(name, options.clone()).await?;
        self.persistence.register(name, &options)?;
        self.event_bus.register_pty_session(session, None, None).await;
        Ok(())
    }

    pub async fn kill_session(&self, name: &str) -> Result<(), CrewlyError> {
        self.backend.kill(name).await?;
        self.persistence.unregister(name).await?;
        self.scheduler.cancel_all_checks_for_session(name).await;
        Ok(())
    }

    /// `saveState -> destroy all sessions -> stop background loops`. Flushing
    /// logs and exiting the process is main's job, after this returns.
    pub async fn shutdown(&self) -> Result<(), CrewlyError> {
        self.persistence.shutdown().await?;
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_session::RuntimeType;

    #[tokio::test]
    async fn bootstrap_start_create_kill_shutdown_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CrewlyConfig::default();
        config.home = Some(dir.path().to_path_buf());

        let runtime = CrewlyRuntime::bootstrap(config, None);
        let restored = runtime.start().await.unwrap();
        assert_eq!(restored, 0);

        let mut options = SessionOptions::new(".", "sh", RuntimeType::ClaudeCode);
        options.args = vec!["-c".to_string(), "sleep 30".to_string()];
        runtime.create_session("dev-1", options).await.unwrap();
        assert!(runtime.backend.exists("dev-1"));

        runtime.kill_session("dev-1").await.unwrap();
        assert!(!runtime.backend.exists("dev-1"));

        runtime.shutdown().await.unwrap();
    }
}
