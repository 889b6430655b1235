//! Subscribes to the Event Bus, classifies each event via the Output
//! Analyzer, and dispatches the recommended action against the session
//! backend.
//!
//! Grounded on the per-subsystem background-task idiom the teacher uses in
//! its orchestrator loop (`tokio::select!` over an incoming queue plus a
//! periodic tick), applied here to continuation events instead of task
//! assignments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ai_session::SessionBackend;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::analyzer::{AnalysisContext, AnalysisResult, OutputAnalyzer, Recommendation};
use crate::config::ContinuationPolicy;
use crate::error::ContinuationActionResult;
use crate::event_bus::{ContinuationEvent, EventBus};
use crate::notifications::{Notification, NotificationRing};

/// Cap on retained history entries per session (§3 invariant).
const HISTORY_CAP: usize = 50;

/// Collaborator that hands out the next unit of work when a session
/// completes and auto-assignment is enabled. A real implementation talks to
/// whatever task-tracking surface the deployment uses; out of scope here.
#[cfg_attr(test, mockall::automock)]
pub trait TaskService: Send + Sync {
    fn next_task(&self, session_name: &str) -> Option<String>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub trigger: String,
    pub conclusion: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IterationTracking {
    pub iterations: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
    pub last_iteration_at: DateTime<Utc>,
    pub history: VecDeque<IterationRecord>,
    pub monitored: bool,
    /// Most recent captured output, used to detect whether the session has
    /// produced anything new since the last event (§4.5 `has_new_output`).
    last_capture: Option<String>,
}

impl IterationTracking {
    fn new(max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            iterations: 0,
            max_iterations,
            started_at: now,
            last_iteration_at: now,
            history: VecDeque::new(),
            monitored: true,
            last_capture: None,
        }
    }

    fn record(&mut self, trigger: &str, conclusion: &str, action: &str) {
        self.last_iteration_at = Utc::now();
        self.history.push_back(IterationRecord {
            iteration: self.iterations,
            trigger: trigger.to_string(),
            conclusion: conclusion.to_string(),
            action: action.to_string(),
            timestamp: self.last_iteration_at,
        });
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
    }

    fn bump(&mut self) {
        self.iterations = (self.iterations + 1).min(self.max_iterations);
    }
}

pub struct ContinuationEngine {
    event_bus: Arc<EventBus>,
    backend: Arc<SessionBackend>,
    notifications: Arc<NotificationRing>,
    trackers: RwLock<HashMap<String, IterationTracking>>,
    policy: ContinuationPolicy,
    capture_lines: usize,
    task_service: Option<Arc<dyn TaskService>>,
}

impl ContinuationEngine {
    pub fn new(
        event_bus: Arc<EventBus>,
        backend: Arc<SessionBackend>,
        notifications: Arc<NotificationRing>,
        policy: ContinuationPolicy,
        capture_lines: usize,
        task_service: Option<Arc<dyn TaskService>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            event_bus,
            backend,
            notifications,
            trackers: RwLock::new(HashMap::new()),
            policy,
            capture_lines,
            task_service,
        })
    }

    /// Spawn the engine's event loop. Stops when `shutdown` fires.
    pub fn start(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut events = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) => {
                                let result = self.handle_event(event.clone()).await;
                                if !result.success {
                                    tracing::warn!(
                                        session = %event.session_name,
                                        error = ?result.error,
                                        "continuation action failed"
                                    );
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "continuation engine dropped events under load");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    async fn handle_event(&self, event: ContinuationEvent) -> ContinuationActionResult {
        if !self.policy.enabled {
            return ContinuationActionResult::ok("no_action", "continuation disabled");
        }

        let mut trackers = self.trackers.write().await;
        let tracker = trackers
            .entry(event.session_name.clone())
            .or_insert_with(|| IterationTracking::new(self.policy.max_iterations));

        if !tracker.monitored {
            return ContinuationActionResult::ok("no_action", "session is paused");
        }

        let recent_output = self.backend.capture_output(&event.session_name, self.capture_lines);
        // recent_output is the cumulative capture window, so "new" means
        // different from the last event's capture, not merely non-empty.
        let has_new_output =
            !recent_output.trim().is_empty() && tracker.last_capture.as_deref() != Some(recent_output.as_str());
        tracker.last_capture = Some(recent_output.clone());

        let analysis = OutputAnalyzer::classify(
            &event.session_name,
            &recent_output,
            AnalysisContext {
                has_new_output,
                iterations: tracker.iterations,
                max_iterations: tracker.max_iterations,
                auto_assign_next: self.policy.auto_assign_next,
            },
        );

        let result = self.dispatch(&event, tracker, &analysis).await;

        tracker.record(
            event.trigger.as_str(),
            &format!("{:?}", analysis.conclusion),
            &result.action,
        );

        result
    }

    async fn dispatch(
        &self,
        event: &ContinuationEvent,
        tracker: &mut IterationTracking,
        analysis: &AnalysisResult,
    ) -> ContinuationActionResult {
        match analysis.recommendation {
            Recommendation::InjectPrompt => {
                tracker.bump();
                let prompt = continuation_prompt(tracker.iterations, tracker.max_iterations, &analysis.evidence);
                self.write_prompt(&event.session_name, &prompt, "inject_prompt").await
            }
            Recommendation::AssignNextTask => {
                if self.policy.auto_assign_next {
                    if let Some(task) = self.task_service.as_ref().and_then(|s| s.next_task(&event.session_name)) {
                        tracker.iterations = 0;
                        tracker.started_at = Utc::now();
                        self.write_prompt(&event.session_name, &task, "assign_next_task").await
                    } else {
                        self.notify_owner(event, tracker, analysis).await
                    }
                } else {
                    self.notify_owner(event, tracker, analysis).await
                }
            }
            Recommendation::RetryWithHints => {
                tracker.bump();
                let prompt = retry_prompt(&analysis.evidence);
                self.write_prompt(&event.session_name, &prompt, "retry_with_hints").await
            }
            Recommendation::NotifyOwner => self.notify_owner(event, tracker, analysis).await,
            Recommendation::PauseAgent => {
                tracker.monitored = false;
                ContinuationActionResult::ok("pause_agent", "session paused, future events ignored")
            }
            Recommendation::NoAction => ContinuationActionResult::ok("no_action", "no classification warranted action"),
        }
    }

    async fn write_prompt(&self, session_name: &str, prompt: &str, action: &str) -> ContinuationActionResult {
        match self.backend.get(session_name) {
            Some(session) => match session.write(prompt.as_bytes()).await {
                Ok(true) => ContinuationActionResult::ok(action, "prompt delivered"),
                Ok(false) => ContinuationActionResult::failed(action, "session already exited"),
                Err(err) => ContinuationActionResult::failed(action, err),
            },
            None => ContinuationActionResult::failed(action, "session not found in backend"),
        }
    }

    async fn notify_owner(
        &self,
        event: &ContinuationEvent,
        tracker: &IterationTracking,
        analysis: &AnalysisResult,
    ) -> ContinuationActionResult {
        self.notifications
            .push(Notification {
                session_name: event.session_name.clone(),
                reason: format!("{:?}", analysis.conclusion),
                evidence: analysis.evidence.clone(),
                iterations: tracker.iterations,
                timestamp: Utc::now(),
                acknowledged: false,
            })
            .await;
        ContinuationActionResult::ok("notify_owner", "recorded for operator review")
    }
}

fn continuation_prompt(iteration: u32, max_iterations: u32, evidence: &[String]) -> String {
    format!(
        "Continuation check-in (iteration {iteration}/{max_iterations}).\n\
         Recent evidence:\n- {}\n\
         If the task is finished, call complete_task.",
        evidence.join("\n- ")
    )
}

fn retry_prompt(evidence: &[String]) -> String {
    format!(
        "The previous attempt hit an error:\n- {}\n\
         Try a different approach rather than repeating the same steps.",
        evidence.join("\n- ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_session::{RuntimeType, SessionOptions};
    use std::time::Duration;

    async fn backend_with_session(name: &str) -> Arc<SessionBackend> {
        let backend = Arc::new(SessionBackend::new());
        let mut options = SessionOptions::new(".", "sh", RuntimeType::ClaudeCode);
        options.args = vec!["-c".to_string(), "cat".to_string()];
        backend.create(name, options).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn idle_event_injects_continuation_prompt_and_bumps_iteration() {
        let bus = EventBus::new(Duration::from_millis(20), Duration::from_millis(100));
        let backend = backend_with_session("dev-2").await;
        let notifications = NotificationRing::new(100);
        let engine = ContinuationEngine::new(
            bus.clone(),
            backend.clone(),
            notifications,
            ContinuationPolicy::default(),
            100,
            None,
        );

        let result = engine
            .handle_event(ContinuationEvent {
                trigger: crate::event_bus::Trigger::ActivityIdle,
                session_name: "dev-2".to_string(),
                agent_id: None,
                project_path: None,
                timestamp: Utc::now(),
                metadata: serde_json::Value::Null,
            })
            .await;

        assert!(result.success);
        assert_eq!(result.action, "inject_prompt");
        let trackers = engine.trackers.read().await;
        assert_eq!(trackers.get("dev-2").unwrap().iterations, 1);
        backend.kill("dev-2").await.unwrap();
    }

    #[tokio::test]
    async fn reaching_max_iterations_forces_notify_owner() {
        let bus = EventBus::new(Duration::from_millis(20), Duration::from_millis(100));
        let backend = backend_with_session("dev-3").await;
        let notifications = NotificationRing::new(100);
        let mut policy = ContinuationPolicy::default();
        policy.max_iterations = 2;
        let engine = ContinuationEngine::new(bus.clone(), backend.clone(), notifications.clone(), policy, 100, None);

        for _ in 0..3 {
            engine
                .handle_event(ContinuationEvent {
                    trigger: crate::event_bus::Trigger::ActivityIdle,
                    session_name: "dev-3".to_string(),
                    agent_id: None,
                    project_path: None,
                    timestamp: Utc::now(),
                    metadata: serde_json::Value::Null,
                })
                .await;
        }

        let trackers = engine.trackers.read().await;
        assert_eq!(trackers.get("dev-3").unwrap().iterations, 2);
        assert_eq!(notifications.snapshot().await.len(), 1);
        backend.kill("dev-3").await.unwrap();
    }

    #[tokio::test]
    async fn repeated_capture_with_no_new_output_keeps_nudging_instead_of_going_stale() {
        let bus = EventBus::new(Duration::from_millis(20), Duration::from_millis(100));
        let backend = Arc::new(SessionBackend::new());
        let mut options = SessionOptions::new(".", "sh", RuntimeType::ClaudeCode);
        options.args = vec!["-c".to_string(), "echo still working...; sleep 30".to_string()];
        backend.create("dev-9", options).await.unwrap();

        // Let the echoed line actually land in the buffer before the first event.
        for _ in 0..50 {
            if backend.capture_output("dev-9", 100).contains("still working") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let notifications = NotificationRing::new(100);
        let engine = ContinuationEngine::new(
            bus.clone(),
            backend.clone(),
            notifications,
            ContinuationPolicy::default(),
            100,
            None,
        );

        let event = ContinuationEvent {
            trigger: crate::event_bus::Trigger::ActivityIdle,
            session_name: "dev-9".to_string(),
            agent_id: None,
            project_path: None,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        };

        // First event: this capture is new to the tracker, so it must not be
        // treated as a repeat of prior output.
        let first = engine.handle_event(event.clone()).await;
        assert!(first.success);
        assert_eq!(first.action, "inject_prompt");

        // Second event with the exact same cumulative capture: genuinely
        // stale now, and must still classify as "no new output" rather than
        // permanently looking "fresh" just because the buffer is non-empty.
        let second = engine.handle_event(event).await;
        assert!(second.success);
        assert_eq!(second.action, "inject_prompt");

        let trackers = engine.trackers.read().await;
        assert_eq!(trackers.get("dev-9").unwrap().iterations, 2);
        backend.kill("dev-9").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_policy_takes_no_action() {
        let bus = EventBus::new(Duration::from_millis(20), Duration::from_millis(100));
        let backend = backend_with_session("dev-8").await;
        let notifications = NotificationRing::new(100);
        let mut policy = ContinuationPolicy::default();
        policy.enabled = false;
        let engine = ContinuationEngine::new(bus, backend.clone(), notifications, policy, 100, None);

        let result = engine
            .handle_event(ContinuationEvent {
                trigger: crate::event_bus::Trigger::ActivityIdle,
                session_name: "dev-8".to_string(),
                agent_id: None,
                project_path: None,
                timestamp: Utc::now(),
                metadata: serde_json::Value::Null,
            })
            .await;
        assert_eq!(result.action, "no_action");
        backend.kill("dev-8").await.unwrap();
    }
}
