//! Bounded, operator-facing record of decisions the Continuation Engine
//! couldn't resolve automatically.
//!
//! Grounded on the same ring-cap idiom the teacher uses for buffered output
//! streams (`VecDeque` capped at a fixed size, oldest evicted first).

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Cap on retained notifications (§3 invariant, §7 user-visible failure).
pub const DEFAULT_RING_CAP: usize = 100;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    pub session_name: String,
    pub reason: String,
    pub evidence: Vec<String>,
    pub iterations: u32,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

pub struct NotificationRing {
    cap: usize,
    entries: RwLock<VecDeque<Notification>>,
}

impl NotificationRing {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            cap,
            entries: RwLock::new(VecDeque::new()),
        })
    }

    pub async fn push(&self, notification: Notification) {
        let mut entries = self.entries.write().await;
        entries.push_back(notification);
        while entries.len() > self.cap {
            entries.pop_front();
        }
    }

    pub async fn snapshot(&self) -> Vec<Notification> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Mark the first unacknowledged entry for `session_name` at or before
    /// `timestamp` as acknowledged.
    pub async fn acknowledge(&self, session_name: &str, timestamp: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut() {
            if entry.session_name == session_name && entry.timestamp <= timestamp && !entry.acknowledged {
                entry.acknowledged = true;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_evicts_oldest_beyond_cap() {
        let ring = NotificationRing::new(2);
        for i in 0..5 {
            ring.push(Notification {
                session_name: format!("dev-{i}"),
                reason: "test".to_string(),
                evidence: vec![],
                iterations: 0,
                timestamp: Utc::now(),
                acknowledged: false,
            })
            .await;
        }
        let snapshot = ring.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].session_name, "dev-3");
        assert_eq!(snapshot[1].session_name, "dev-4");
    }

    #[tokio::test]
    async fn acknowledge_marks_matching_entry() {
        let ring = NotificationRing::new(10);
        let now = Utc::now();
        ring.push(Notification {
            session_name: "dev-1".to_string(),
            reason: "STUCK_OR_ERROR".to_string(),
            evidence: vec!["Error: x".to_string()],
            iterations: 10,
            timestamp: now,
            acknowledged: false,
        })
        .await;

        assert!(ring.acknowledge("dev-1", now).await);
        assert!(ring.snapshot().await[0].acknowledged);
    }
}
