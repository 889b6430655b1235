//! Time- and event-driven dispatch of check-ins, reminders, and
//! continuation probes, with adaptive backoff.
//!
//! No teacher module is a scheduler; grounded on the periodic-interval-loop
//! idiom used throughout the teacher (multiple `tokio::time::interval`
//! loops per subsystem) combined with a `BinaryHeap` priority queue, the
//! standard Rust idiom for a fire-time-ordered queue.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use ai_session::SessionBackend;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::SchedulerDefaults;
use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleType {
    CheckIn,
    CommitReminder,
    ProgressCheck,
    Continuation,
    Custom,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecurringSpec {
    pub interval: Duration,
    pub max_occurrences: Option<u32>,
    pub current_occurrence: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledMessage {
    pub id: u64,
    pub session_name: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
    pub schedule_type: ScheduleType,
    pub recurring: Option<RecurringSpec>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct SchedulerStats {
    pub pending: usize,
    pub fired_total: u64,
    pub delivery_failures: u64,
}

/// Min-heap key: earliest `scheduled_for` first, ties broken by insertion
/// order (earlier insertion first).
#[derive(Eq, PartialEq)]
struct HeapKey {
    scheduled_for: DateTime<Utc>,
    sequence: u64,
    id: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.scheduled_for, self.sequence).cmp(&(other.scheduled_for, other.sequence))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Collaborator queried by `schedule_adaptive_checkin` to decide whether a
/// session has been idle or active since its last probe.
pub trait ActivitySource: Send + Sync {
    fn is_idle(&self, session_name: &str) -> bool;
}

pub struct Scheduler {
    backend: Arc<SessionBackend>,
    event_bus: Arc<EventBus>,
    entries: RwLock<HashMap<u64, ScheduledMessage>>,
    heap: RwLock<BinaryHeap<Reverse<HeapKey>>>,
    next_id: AtomicU64,
    sequence: AtomicU64,
    defaults: SchedulerDefaults,
    fired_total: AtomicU64,
    delivery_failures: AtomicU64,
}

impl Scheduler {
    pub fn new(backend: Arc<SessionBackend>, event_bus: Arc<EventBus>, defaults: SchedulerDefaults) -> Arc<Self> {
        Arc::new(Self {
            backend,
            event_bus,
            entries: RwLock::new(HashMap::new()),
            heap: RwLock::new(BinaryHeap::new()),
            next_id: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            defaults,
            fired_total: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        })
    }

    async fn insert(&self, message: ScheduledMessage) -> u64 {
        let id = message.id;
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.write().await.push(Reverse(HeapKey {
            scheduled_for: message.scheduled_for,
            sequence,
            id,
        }));
        self.entries.write().await.insert(id, message);
        id
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub async fn schedule_check(&self, session_name: &str, minutes: f64, message: &str) -> u64 {
        let id = self.next_id();
        self.insert(ScheduledMessage {
            id,
            session_name: session_name.to_string(),
            message: message.to_string(),
            scheduled_for: Utc::now() + minutes_duration(minutes),
            schedule_type: ScheduleType::CheckIn,
            recurring: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        })
        .await
    }

    pub async fn schedule_recurring_check(
        &self,
        session_name: &str,
        interval_minutes: f64,
        message: &str,
        max_occurrences: Option<u32>,
    ) -> u64 {
        let id = self.next_id();
        self.insert(ScheduledMessage {
            id,
            session_name: session_name.to_string(),
            message: message.to_string(),
            scheduled_for: Utc::now() + minutes_duration(interval_minutes),
            schedule_type: ScheduleType::ProgressCheck,
            recurring: Some(RecurringSpec {
                interval: minutes_duration(interval_minutes),
                max_occurrences,
                current_occurrence: 0,
            }),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        })
        .await
    }

    /// Canonical bundle: 5-min initial check-in, 25-min commit reminder
    /// (recurring), 30-min progress check (recurring).
    pub async fn schedule_default_checkins(&self, session_name: &str) -> Vec<u64> {
        let checkin = self.schedule_check(session_name, 5.0, "How's it going? Quick check-in.").await;
        let commit_id = self.next_id();
        let commit = self
            .insert(ScheduledMessage {
                id: commit_id,
                session_name: session_name.to_string(),
                message: "Remember to commit your progress.".to_string(),
                scheduled_for: Utc::now() + minutes_duration(25.0),
                schedule_type: ScheduleType::CommitReminder,
                recurring: Some(RecurringSpec {
                    interval: minutes_duration(25.0),
                    max_occurrences: None,
                    current_occurrence: 0,
                }),
                metadata: serde_json::Value::Null,
                created_at: Utc::now(),
            })
            .await;
        let progress = self.schedule_recurring_check(session_name, 30.0, "Progress check.", None).await;
        vec![checkin, commit, progress]
    }

    /// One-shot that, on fire, publishes an `explicit_request` instead of
    /// writing directly to the session.
    pub async fn schedule_continuation_check(
        &self,
        session_name: &str,
        delay_minutes: f64,
        agent_id: Option<String>,
        project_path: Option<String>,
    ) -> u64 {
        let id = self.next_id();
        let metadata = serde_json::json!({"agent_id": agent_id, "project_path": project_path});
        self.insert(ScheduledMessage {
            id,
            session_name: session_name.to_string(),
            message: String::new(),
            scheduled_for: Utc::now() + minutes_duration(delay_minutes),
            schedule_type: ScheduleType::Continuation,
            recurring: None,
            metadata,
            created_at: Utc::now(),
        })
        .await
    }

    /// Choose the next interval in `[min, max]` by multiplying (idle) or
    /// dividing (active) the base interval by `adjustment_factor`, and
    /// schedule a recurring check at that cadence.
    pub async fn schedule_adaptive_checkin(&self, session_name: &str, activity: &dyn ActivitySource) -> u64 {
        let factor = self.defaults.adjustment_factor;
        let interval = if activity.is_idle(session_name) {
            self.defaults.base_minutes * factor
        } else {
            self.defaults.base_minutes / factor
        }
        .clamp(self.defaults.min_minutes, self.defaults.max_minutes);

        self.schedule_recurring_check(session_name, interval, "Adaptive check-in.", None).await
    }

    /// Cancel a single scheduled entry. Removal from `entries` is enough —
    /// the heap entry becomes a tombstone, skipped when it's eventually
    /// popped.
    pub async fn cancel_check(&self, id: u64) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    pub async fn cancel_all_checks_for_session(&self, session_name: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.session_name != session_name);
        before - entries.len()
    }

    pub async fn checks_for_session(&self, session_name: &str) -> Vec<ScheduledMessage> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.session_name == session_name)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.entries.read().await.len(),
            fired_total: self.fired_total.load(AtomicOrdering::Relaxed),
            delivery_failures: self.delivery_failures.load(AtomicOrdering::Relaxed),
        }
    }

    /// Drop tombstoned heap entries (canceled messages still sitting in the
    /// heap) so it doesn't grow unboundedly under heavy cancel traffic.
    pub async fn cleanup(&self) {
        let entries = self.entries.read().await;
        let mut heap = self.heap.write().await;
        let live: BinaryHeap<Reverse<HeapKey>> = std::mem::take(&mut *heap)
            .into_iter()
            .filter(|Reverse(key)| entries.contains_key(&key.id))
            .collect();
        *heap = live;
    }

    /// Pop and fire every entry whose `scheduled_for` is at or before now.
    /// If the caller slept through multiple fire times for a recurring
    /// entry, only the most recent occurrence is delivered — the others
    /// are folded into `current_occurrence` without a separate write.
    pub async fn tick(&self) {
        let now = Utc::now();
        loop {
            let due_id = {
                let mut heap = self.heap.write().await;
                match heap.peek() {
                    Some(Reverse(key)) if key.scheduled_for <= now => heap.pop().map(|Reverse(k)| k.id),
                    _ => None,
                }
            };
            let Some(id) = due_id else { break };

            let Some(mut message) = self.entries.write().await.remove(&id) else {
                continue; // tombstoned: canceled since it was scheduled
            };

            self.fire(&message).await;
            self.fired_total.fetch_add(1, AtomicOrdering::Relaxed);

            if let Some(recurring) = message.recurring.as_mut() {
                let missed = ((now - message.scheduled_for).num_milliseconds()
                    / recurring.interval.num_milliseconds().max(1))
                .max(0) as u32
                    + 1;
                recurring.current_occurrence += missed;

                let exhausted = recurring
                    .max_occurrences
                    .map(|max| recurring.current_occurrence >= max)
                    .unwrap_or(false);

                if !exhausted {
                    message.scheduled_for = message.scheduled_for + recurring.interval * missed as i32;
                    self.insert(message).await;
                }
            }
        }
    }

    async fn fire(&self, message: &ScheduledMessage) {
        if message.schedule_type == ScheduleType::Continuation {
            let agent_id = message.metadata.get("agent_id").and_then(|v| v.as_str()).map(String::from);
            let project_path = message.metadata.get("project_path").and_then(|v| v.as_str()).map(String::from);
            self.event_bus.emit_explicit_request(&message.session_name, agent_id, project_path);
            return;
        }

        match self.backend.get(&message.session_name) {
            Some(session) => {
                if let Err(err) = session.write(message.message.as_bytes()).await {
                    tracing::warn!(session = %message.session_name, %err, "scheduled delivery failed");
                    self.delivery_failures.fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
            None => {
                tracing::debug!(session = %message.session_name, "scheduled delivery skipped: session gone");
            }
        }
    }

    /// Spawn the periodic tick loop. Stops when `shutdown` fires.
    pub fn start(self: Arc<Self>, tick_interval: StdDuration, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

fn minutes_duration(minutes: f64) -> Duration {
    Duration::milliseconds((minutes * 60_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_session::{RuntimeType, SessionOptions};

    struct AlwaysIdle;
    impl ActivitySource for AlwaysIdle {
        fn is_idle(&self, _session_name: &str) -> bool {
            true
        }
    }

    async fn scheduler_with_session(name: &str) -> (Arc<Scheduler>, Arc<SessionBackend>) {
        let backend = Arc::new(SessionBackend::new());
        let mut options = SessionOptions::new(".", "sh", RuntimeType::ClaudeCode);
        options.args = vec!["-c".to_string(), "cat".to_string()];
        backend.create(name, options).await.unwrap();
        let bus = EventBus::new(std::time::Duration::from_millis(50), std::time::Duration::from_millis(100));
        let scheduler = Scheduler::new(backend.clone(), bus, SchedulerDefaults::default());
        (scheduler, backend)
    }

    #[tokio::test]
    async fn one_shot_fires_and_is_removed() {
        let (scheduler, backend) = scheduler_with_session("dev-1").await;
        let id = scheduler.schedule_check("dev-1", 0.0, "hello").await;
        scheduler.tick().await;
        assert!(scheduler.checks_for_session("dev-1").await.iter().all(|m| m.id != id));
        backend.kill("dev-1").await.unwrap();
    }

    #[tokio::test]
    async fn recurring_check_stops_after_max_occurrences() {
        let (scheduler, backend) = scheduler_with_session("dev-4").await;
        let id = scheduler.schedule_recurring_check("dev-4", 0.0, "commit reminder", Some(3)).await;

        for _ in 0..3 {
            scheduler.tick().await;
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        assert!(scheduler.checks_for_session("dev-4").await.iter().all(|m| m.id != id));
        backend.kill("dev-4").await.unwrap();
    }

    #[tokio::test]
    async fn cancel_check_prevents_future_firing() {
        let (scheduler, backend) = scheduler_with_session("dev-5").await;
        let id = scheduler.schedule_check("dev-5", 0.0, "hello").await;
        assert!(scheduler.cancel_check(id).await);
        scheduler.tick().await;
        assert_eq!(scheduler.stats().await.fired_total, 0);
        backend.kill("dev-5").await.unwrap();
    }

    #[tokio::test]
    async fn cancel_all_checks_for_session_removes_every_entry() {
        let (scheduler, backend) = scheduler_with_session("dev-6").await;
        scheduler.schedule_check("dev-6", 5.0, "a").await;
        scheduler.schedule_check("dev-6", 10.0, "b").await;
        let removed = scheduler.cancel_all_checks_for_session("dev-6").await;
        assert_eq!(removed, 2);
        assert!(scheduler.checks_for_session("dev-6").await.is_empty());
        backend.kill("dev-6").await.unwrap();
    }

    #[tokio::test]
    async fn adaptive_checkin_widens_interval_when_idle() {
        let (scheduler, backend) = scheduler_with_session("dev-7").await;
        scheduler.schedule_adaptive_checkin("dev-7", &AlwaysIdle).await;
        let checks = scheduler.checks_for_session("dev-7").await;
        let recurring = checks[0].recurring.as_ref().unwrap();
        assert!(recurring.interval.num_minutes() >= SchedulerDefaults::default().base_minutes as i64);
        backend.kill("dev-7").await.unwrap();
    }
}
