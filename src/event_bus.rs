//! In-process publish/subscribe for continuation events, with per-key
//! debounce and dedup windows measured on a monotonic clock.
//!
//! Grounded on the channel-per-subscriber registration style of the
//! teacher's message bus, generalized from a generic message envelope to
//! the fixed, spec-shaped [`ContinuationEvent`] tagged union.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use ai_session::Session;

/// The kind of occurrence that prompted a continuation event, and any
/// trigger-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    PtyExit,
    ActivityIdle,
    HeartbeatStale,
    ExplicitRequest,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PtyExit => "pty_exit",
            Self::ActivityIdle => "activity_idle",
            Self::HeartbeatStale => "heartbeat_stale",
            Self::ExplicitRequest => "explicit_request",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContinuationEvent {
    pub trigger: Trigger,
    pub session_name: String,
    pub agent_id: Option<String>,
    pub project_path: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub metadata: serde_json::Value,
}

impl ContinuationEvent {
    fn key(&self) -> (String, &'static str) {
        (self.session_name.clone(), self.trigger.as_str())
    }
}

struct Pending {
    latest: ContinuationEvent,
    last_update: Instant,
}

/// Debounced, deduplicated publish/subscribe channel for
/// [`ContinuationEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<ContinuationEvent>,
    pending: Arc<DashMap<(String, &'static str), Pending>>,
    last_delivered: Arc<DashMap<(String, &'static str), Instant>>,
    registered_pty_sessions: Arc<DashSet<String>>,
    pty_watchers: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
    debounce: Duration,
    dedup: Duration,
}

impl EventBus {
    pub fn new(debounce: Duration, dedup: Duration) -> Arc<Self> {
        let bus = Arc::new(Self {
            sender: broadcast::channel(1024).0,
            pending: Arc::new(DashMap::new()),
            last_delivered: Arc::new(DashMap::new()),
            registered_pty_sessions: Arc::new(DashSet::new()),
            pty_watchers: Arc::new(RwLock::new(HashMap::new())),
            debounce,
            dedup,
        });
        bus.clone().spawn_debounce_flusher();
        bus.clone().spawn_dedup_cleanup();
        bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContinuationEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to a session's exit hook; emits `pty_exit` on termination.
    /// Repeated registration of the same name is a no-op.
    pub async fn register_pty_session(
        self: &Arc<Self>,
        session: Arc<Session>,
        agent_id: Option<String>,
        project_path: Option<String>,
    ) {
        if !self.registered_pty_sessions.insert(session.name.clone()) {
            return;
        }

        let bus = self.clone();
        let name = session.name.clone();
        let mut exit_rx = session.on_exit();
        let handle = tokio::spawn(async move {
            if exit_rx.recv().await.is_ok() {
                let event = ContinuationEvent {
                    trigger: Trigger::PtyExit,
                    session_name: name,
                    agent_id,
                    project_path,
                    timestamp: chrono::Utc::now(),
                    metadata: serde_json::Value::Null,
                };
                bus.trigger(event);
            }
        });
        self.pty_watchers.write().await.insert(session.name.clone(), handle);
    }

    /// Cancel pending debounced events and the pty watcher for a session.
    pub async fn unregister_session(&self, session_name: &str) {
        self.pending.retain(|(name, _), _| name != session_name);
        self.last_delivered.retain(|(name, _), _| name != session_name);
        self.registered_pty_sessions.remove(session_name);
        if let Some(handle) = self.pty_watchers.write().await.remove(session_name) {
            handle.abort();
        }
    }

    pub fn emit_activity_idle(&self, session_name: &str, metadata: serde_json::Value) {
        self.emit_debounced(ContinuationEvent {
            trigger: Trigger::ActivityIdle,
            session_name: session_name.to_string(),
            agent_id: None,
            project_path: None,
            timestamp: chrono::Utc::now(),
            metadata,
        });
    }

    pub fn emit_heartbeat_stale(&self, session_name: &str, metadata: serde_json::Value) {
        self.emit_debounced(ContinuationEvent {
            trigger: Trigger::HeartbeatStale,
            session_name: session_name.to_string(),
            agent_id: None,
            project_path: None,
            timestamp: chrono::Utc::now(),
            metadata,
        });
    }

    pub fn emit_explicit_request(&self, session_name: &str, agent_id: Option<String>, project_path: Option<String>) {
        self.emit_debounced(ContinuationEvent {
            trigger: Trigger::ExplicitRequest,
            session_name: session_name.to_string(),
            agent_id,
            project_path,
            timestamp: chrono::Utc::now(),
            metadata: serde_json::Value::Null,
        });
    }

    fn emit_debounced(&self, event: ContinuationEvent) {
        let key = event.key();
        self.pending.insert(
            key,
            Pending {
                latest: event,
                last_update: Instant::now(),
            },
        );
    }

    /// Publish immediately, bypassing debounce; still honors dedup.
    pub fn trigger(&self, event: ContinuationEvent) {
        let key = event.key();
        if let Some(last) = self.last_delivered.get(&key) {
            if last.elapsed() < self.dedup {
                return;
            }
        }
        self.last_delivered.insert(key, Instant::now());
        let _ = self.sender.send(event);
    }

    fn spawn_debounce_flusher(self: Arc<Self>) {
        let tick = (self.debounce / 4).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let mut ready = Vec::new();
                self.pending.retain(|_, pending| {
                    if pending.last_update.elapsed() >= self.debounce {
                        ready.push(pending.latest.clone());
                        false
                    } else {
                        true
                    }
                });
                for event in ready {
                    self.trigger(event);
                }
            }
        });
    }

    fn spawn_dedup_cleanup(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let horizon = self.dedup * 2;
                self.last_delivered.retain(|_, last| last.elapsed() < horizon);
            }
        });
    }
}
