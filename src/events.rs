//! In-process event fan-out.
//!
//! The engine publishes typed events onto a broadcast channel; subscribers
//! hold a receiver and drop it to unsubscribe. Project-scoped consumers
//! (the SSE layer) resolve each event's project through a TTL cache before
//! forwarding.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::DbHandle;
use crate::models::{Issue, LogEntry, SessionStatus};

/// Default capacity of the broadcast channel. Slow subscribers that lag
/// past this many events miss the overflow; the durable log remains
/// authoritative.
const CHANNEL_CAPACITY: usize = 1024;

/// How long a resolved issue → project mapping stays valid.
pub const PROJECT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum EngineEvent {
    Log {
        issue_id: String,
        execution_id: String,
        entry: LogEntry,
    },
    State {
        issue_id: String,
        execution_id: String,
        state: SessionStatus,
    },
    Settled {
        issue_id: String,
        execution_id: String,
        final_status: SessionStatus,
    },
    IssueUpdated {
        issue: Issue,
    },
    ChangesSummary {
        project_id: String,
        summary: serde_json::Value,
    },
}

impl EngineEvent {
    /// Issue this event is about, when it is issue-scoped.
    pub fn issue_id(&self) -> Option<&str> {
        match self {
            Self::Log { issue_id, .. }
            | Self::State { issue_id, .. }
            | Self::Settled { issue_id, .. } => Some(issue_id),
            Self::IssueUpdated { issue } => Some(&issue.id),
            Self::ChangesSummary { .. } => None,
        }
    }

    /// Project id carried directly on the event, when known without a lookup.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Self::IssueUpdated { issue } => Some(&issue.project_id),
            Self::ChangesSummary { project_id, .. } => Some(project_id),
            _ => None,
        }
    }

    /// Name of the SSE event this maps to. A settlement is delivered to
    /// clients as `done`.
    pub fn sse_event_name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::State { .. } => "state",
            Self::Settled { .. } => "done",
            Self::IssueUpdated { .. } => "issue-updated",
            Self::ChangesSummary { .. } => "changes-summary",
        }
    }
}

/// Process-wide publisher for engine events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Delivery is best-effort: with no subscribers the
    /// event is dropped, which is fine because all state is persisted
    /// before publishing.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// TTL cache mapping issue ids to project ids, shared by all
/// project-scoped subscribers. Expired entries are evicted lazily on
/// lookup; issue deletion invalidates eagerly.
pub struct ProjectCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl ProjectCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, issue_id: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(issue_id) {
            Some((project_id, expires_at)) if Instant::now() < *expires_at => {
                Some(project_id.clone())
            }
            Some(_) => {
                entries.remove(issue_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, issue_id: &str, project_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                issue_id.to_string(),
                (project_id.to_string(), Instant::now() + self.ttl),
            );
        }
    }

    pub fn invalidate(&self, issue_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(issue_id);
        }
    }

    /// Resolve an issue's project, falling through to a one-shot DB lookup
    /// on cache miss.
    pub async fn resolve(&self, issue_id: &str, db: &DbHandle) -> Option<String> {
        if let Some(project_id) = self.get(issue_id) {
            return Some(project_id);
        }
        let issue_id_owned = issue_id.to_string();
        let issue = db
            .call(move |db| db.get_issue(&issue_id_owned))
            .await
            .ok()
            .flatten()?;
        self.insert(issue_id, &issue.project_id);
        Some(issue.project_id)
    }

    /// Decide whether an event belongs to the given project, resolving
    /// through the cache where the event doesn't carry its project id.
    /// Deletion events invalidate their cache entry.
    pub async fn event_matches_project(
        &self,
        event: &EngineEvent,
        project_id: &str,
        db: &DbHandle,
    ) -> bool {
        if let EngineEvent::IssueUpdated { issue } = event {
            if issue.is_deleted {
                self.invalidate(&issue.id);
            }
        }
        if let Some(direct) = event.project_id() {
            return direct == project_id;
        }
        match event.issue_id() {
            Some(issue_id) => {
                self.resolve(issue_id, db).await.as_deref() == Some(project_id)
            }
            None => false,
        }
    }
}

impl Default for ProjectCache {
    fn default() -> Self {
        Self::new(PROJECT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BitkDb;
    use crate::models::IssueStatus;

    #[test]
    fn cache_returns_value_before_ttl() {
        let cache = ProjectCache::new(Duration::from_secs(60));
        cache.insert("iss", "proj");
        assert_eq!(cache.get("iss").as_deref(), Some("proj"));
    }

    #[test]
    fn cache_expires_and_evicts_lazily() {
        let cache = ProjectCache::new(Duration::from_millis(0));
        cache.insert("iss", "proj");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("iss"), None);
        // The expired entry was removed on lookup.
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn cache_invalidation_removes_entry() {
        let cache = ProjectCache::new(Duration::from_secs(60));
        cache.insert("iss", "proj");
        cache.invalidate("iss");
        assert_eq!(cache.get("iss"), None);
    }

    #[tokio::test]
    async fn resolve_falls_through_to_db() {
        let db = DbHandle::new(BitkDb::new_in_memory().unwrap());
        let (project, issue) = {
            let guard = db.lock_sync().unwrap();
            let project = guard.create_project("p", None, None, None).unwrap();
            let issue = guard
                .create_issue(&project.id, "i", None, IssueStatus::Todo, None)
                .unwrap();
            (project, issue)
        };
        let cache = ProjectCache::new(Duration::from_secs(60));
        assert_eq!(
            cache.resolve(&issue.id, &db).await.as_deref(),
            Some(project.id.as_str())
        );
        // Second hit comes from the cache.
        assert_eq!(cache.get(&issue.id).as_deref(), Some(project.id.as_str()));
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::ChangesSummary {
            project_id: "p1".into(),
            summary: serde_json::json!({"files": 2}),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.sse_event_name(), "changes-summary");
        assert_eq!(event.project_id(), Some("p1"));
    }

    #[tokio::test]
    async fn scoped_filter_drops_foreign_events() {
        let db = DbHandle::new(BitkDb::new_in_memory().unwrap());
        let cache = ProjectCache::new(Duration::from_secs(60));
        cache.insert("iss-a", "proj-a");
        let event = EngineEvent::State {
            issue_id: "iss-a".into(),
            execution_id: "x".into(),
            state: SessionStatus::Running,
        };
        assert!(cache.event_matches_project(&event, "proj-a", &db).await);
        assert!(!cache.event_matches_project(&event, "proj-b", &db).await);
    }
}
