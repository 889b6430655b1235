//! Periodic sweep over all sessions: detects idleness by diffing recent
//! terminal output and publishes `activity_idle` / `team_member_status`
//! events.
//!
//! Grounded directly on the teacher's `AgentOutputStream` (ring buffer plus
//! a periodic cleanup tick) and `MonitoringSystem`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ai_session::SessionBackend;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::event_bus::EventBus;

/// Per-session probe timeout (§4.8: 500-800 ms).
const PROBE_TIMEOUT: Duration = Duration::from_millis(700);
/// Total sweep budget (§4.8: 2 s).
const SWEEP_BUDGET: Duration = Duration::from_secs(2);
/// Cap on the snapshot cache (§4.8).
const SNAPSHOT_CACHE_CAP: usize = 10;
/// Cleanup cadence for the snapshot cache (§4.8: every 5 min).
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Lines captured per probe (§4.8: last 10 lines, bounded 1 KB).
const CAPTURE_LINES: usize = 10;
const CAPTURE_BYTE_CAP: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingStatus {
    InProgress,
    Idle,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TeamMemberStatusEvent {
    pub session_name: String,
    pub status: WorkingStatus,
    pub timestamp: DateTime<Utc>,
}

struct Snapshot {
    last_output: String,
    status: WorkingStatus,
    consecutive_idle: u32,
    last_seen: tokio::time::Instant,
}

pub struct ActivityMonitor {
    backend: Arc<SessionBackend>,
    event_bus: Arc<EventBus>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
    status_tx: broadcast::Sender<TeamMemberStatusEvent>,
    idle_consecutive_threshold: u32,
}

impl ActivityMonitor {
    pub fn new(backend: Arc<SessionBackend>, event_bus: Arc<EventBus>, idle_consecutive_threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            backend,
            event_bus,
            snapshots: RwLock::new(HashMap::new()),
            status_tx: broadcast::channel(256).0,
            idle_consecutive_threshold,
        })
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TeamMemberStatusEvent> {
        self.status_tx.subscribe()
    }

    /// One sweep over every registered session, bounded by `SWEEP_BUDGET`
    /// in total; a slow or hung probe for one session does not block
    /// others beyond its own `PROBE_TIMEOUT`.
    pub async fn sweep(&self) {
        let names = self.backend.list();
        let _ = tokio::time::timeout(SWEEP_BUDGET, async {
            for name in names {
                self.probe_one(&name).await;
            }
        })
        .await;
    }

    async fn probe_one(&self, name: &str) {
        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let captured = tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::task::spawn_blocking(move || backend.capture_output(&name_owned, CAPTURE_LINES)),
        )
        .await;

        let current = match captured {
            Ok(Ok(output)) => truncate_to_bytes(&output, CAPTURE_BYTE_CAP),
            _ => {
                tracing::debug!(session = name, "activity probe timed out");
                return;
            }
        };

        let mut snapshots = self.snapshots.write().await;
        let previous = snapshots.remove(name);

        let activity_detected = match &previous {
            Some(prev) => prev.last_output != current && !current.trim().is_empty(),
            None => !current.trim().is_empty(),
        };

        let mut consecutive_idle = previous.as_ref().map(|p| p.consecutive_idle).unwrap_or(0);
        let previous_status = previous.as_ref().map(|p| p.status);

        let status = if activity_detected {
            consecutive_idle = 0;
            WorkingStatus::InProgress
        } else {
            consecutive_idle += 1;
            WorkingStatus::Idle
        };

        if previous_status != Some(status) {
            let event = TeamMemberStatusEvent {
                session_name: name.to_string(),
                status,
                timestamp: Utc::now(),
            };
            let _ = self.status_tx.send(event);
        }

        if status == WorkingStatus::Idle && consecutive_idle >= self.idle_consecutive_threshold {
            self.event_bus.emit_activity_idle(name, serde_json::json!({"consecutive_idle": consecutive_idle}));
        }

        snapshots.insert(
            name.to_string(),
            Snapshot {
                last_output: current,
                status,
                consecutive_idle,
                last_seen: tokio::time::Instant::now(),
            },
        );
    }

    /// Drop snapshots for sessions no longer in the backend, then cap the
    /// cache to the least-recently-seen `SNAPSHOT_CACHE_CAP` entries.
    async fn cleanup(&self) {
        let live: std::collections::HashSet<String> = self.backend.list().into_iter().collect();
        let mut snapshots = self.snapshots.write().await;
        snapshots.retain(|name, _| live.contains(name));

        if snapshots.len() > SNAPSHOT_CACHE_CAP {
            let mut by_age: Vec<(String, tokio::time::Instant)> =
                snapshots.iter().map(|(k, v)| (k.clone(), v.last_seen)).collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            let excess = snapshots.len() - SNAPSHOT_CACHE_CAP;
            for (name, _) in by_age.into_iter().take(excess) {
                snapshots.remove(&name);
            }
        }
    }

    pub fn start(self: Arc<Self>, sweep_interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_tick = tokio::time::interval(sweep_interval);
            let mut cleanup_tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_tick.tick() => self.sweep().await,
                    _ = cleanup_tick.tick() => self.cleanup().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

fn truncate_to_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = s.len() - max_bytes;
    while end < s.len() && !s.is_char_boundary(end) {
        end += 1;
    }
    s[end..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_session::{RuntimeType, SessionOptions};

    async fn monitor_with_session(name: &str) -> (Arc<ActivityMonitor>, Arc<SessionBackend>) {
        let backend = Arc::new(SessionBackend::new());
        let mut options = SessionOptions::new(".", "sh", RuntimeType::ClaudeCode);
        options.args = vec!["-c".to_string(), "cat".to_string()];
        backend.create(name, options).await.unwrap();
        let bus = EventBus::new(Duration::from_millis(50), Duration::from_millis(200));
        let monitor = ActivityMonitor::new(backend.clone(), bus, 2);
        (monitor, backend)
    }

    #[tokio::test]
    async fn first_sweep_with_output_is_in_progress() {
        let (monitor, backend) = monitor_with_session("dev-1").await;
        let session = backend.get("dev-1").unwrap();
        session.write(b"hello\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut status_rx = monitor.subscribe_status();
        monitor.sweep().await;
        let event = status_rx.try_recv().unwrap();
        assert_eq!(event.status, WorkingStatus::InProgress);
        backend.kill("dev-1").await.unwrap();
    }

    #[tokio::test]
    async fn repeated_idle_sweeps_publish_activity_idle() {
        let (monitor, backend) = monitor_with_session("dev-2").await;
        let mut events = monitor.event_bus.subscribe();

        for _ in 0..3 {
            monitor.sweep().await;
        }

        let event = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
        assert!(event.is_ok(), "expected an activity_idle event after repeated idle sweeps");
        backend.kill("dev-2").await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_drops_snapshots_for_removed_sessions() {
        let (monitor, backend) = monitor_with_session("dev-3").await;
        monitor.sweep().await;
        assert_eq!(monitor.snapshots.read().await.len(), 1);

        backend.kill("dev-3").await.unwrap();
        monitor.cleanup().await;
        assert_eq!(monitor.snapshots.read().await.len(), 0);
    }
}
