//! In-memory session store.
//!
//! Sessions are keyed by the agent-issued id. A request that arrives before
//! the agent has issued one gets a temporary `temp_<uuid>` id which is
//! rekeyed on the first successful completion. Nothing here is persisted;
//! durable storage is a collaborator's concern.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use courier_protocol::AgentResponse;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub const TEMP_SESSION_PREFIX: &str = "temp_";

/// A resumable conversational context for one user in one project
/// directory.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub total_cost: f64,
    pub message_count: u32,
    pub tools_used: BTreeSet<String>,
    /// True until the agent issues a real session id.
    pub is_new: bool,
}

impl Session {
    fn new(user_id: i64, project_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("{TEMP_SESSION_PREFIX}{}", Uuid::new_v4()),
            user_id,
            project_path,
            created_at: now,
            last_used: now,
            total_cost: 0.0,
            message_count: 0,
            tools_used: BTreeSet::new(),
            is_new: true,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.session_id.starts_with(TEMP_SESSION_PREFIX)
    }

    pub fn is_expired(&self, timeout_hours: i64) -> bool {
        Utc::now().signed_duration_since(self.last_used) > Duration::hours(timeout_hours)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserSessionSummary {
    pub user_id: i64,
    pub session_count: usize,
    pub total_cost: f64,
    pub total_messages: u64,
}

/// All timestamps are timezone-aware UTC by construction, so ordering and
/// expiry comparisons never mix naive and aware values.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    timeout_hours: i64,
}

impl SessionStore {
    pub fn new(timeout_hours: i64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout_hours,
        }
    }

    /// Return the stored session when `session_id` names one owned by this
    /// user; otherwise create a fresh temporary session. An unknown id is
    /// not an error here — resuming something the store no longer has just
    /// starts over.
    pub async fn get_or_create(
        &self,
        user_id: i64,
        project_path: &Path,
        session_id: Option<&str>,
    ) -> Session {
        let mut sessions = self.sessions.lock().await;

        if let Some(id) = session_id {
            if let Some(existing) = sessions.get_mut(id) {
                if existing.user_id == user_id {
                    existing.last_used = Utc::now();
                    debug!(session_id = id, user_id, "resuming stored session");
                    return existing.clone();
                }
                warn!(session_id = id, user_id, "session belongs to another user");
            } else {
                debug!(session_id = id, user_id, "requested session not stored; starting fresh");
            }
        }

        let session = Session::new(user_id, project_path.to_path_buf());
        info!(session_id = %session.session_id, user_id, "created session");
        sessions.insert(session.session_id.clone(), session.clone());
        session
    }

    /// Fold a completed response into the stored session. A temporary
    /// session is rekeyed to the agent-issued id the first time one
    /// arrives.
    pub async fn update(&self, old_id: &str, response: &AgentResponse) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let mut session = match sessions.remove(old_id) {
            Some(session) => session,
            None => {
                warn!(session_id = old_id, "update for unknown session");
                return None;
            }
        };

        if session.is_new && !response.session_id.is_empty() {
            info!(
                old_id,
                new_id = %response.session_id,
                "rekeying session to agent-issued id"
            );
            session.session_id = response.session_id.clone();
            session.is_new = false;
        }

        session.last_used = Utc::now();
        session.total_cost += response.cost;
        session.message_count += 1;
        session
            .tools_used
            .extend(response.tools_used.iter().map(|t| t.name.clone()));

        sessions.insert(session.session_id.clone(), session.clone());
        Some(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Remove sessions idle past the configured timeout.
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(self.timeout_hours))
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "removed expired sessions");
        }
        expired.len()
    }

    /// The user's sessions, most recently used first.
    pub async fn list_user_sessions(&self, user_id: i64) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        let mut mine: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        mine
    }

    /// Most recent resumable (non-temporary) session for this user and
    /// project directory.
    pub async fn most_recent_for(&self, user_id: i64, project_path: &Path) -> Option<Session> {
        self.list_user_sessions(user_id)
            .await
            .into_iter()
            .find(|s| s.project_path == project_path && !s.is_temporary())
    }

    pub async fn user_summary(&self, user_id: i64) -> UserSessionSummary {
        let mine = self.list_user_sessions(user_id).await;
        UserSessionSummary {
            user_id,
            session_count: mine.len(),
            total_cost: mine.iter().map(|s| s.total_cost).sum(),
            total_messages: mine.iter().map(|s| u64::from(s.message_count)).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use courier_protocol::ToolInvocation;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn response(session_id: &str, cost: f64) -> AgentResponse {
        AgentResponse {
            content: "done".to_string(),
            session_id: session_id.to_string(),
            cost,
            duration_ms: 10,
            num_turns: 1,
            is_error: false,
            error_kind: None,
            tools_used: vec![ToolInvocation {
                name: "read".to_string(),
                timestamp: None,
                input: Value::Null,
            }],
        }
    }

    #[tokio::test]
    async fn fresh_sessions_get_temporary_ids() {
        let store = SessionStore::new(24);
        let session = store.get_or_create(1, Path::new("/w"), None).await;
        assert!(session.is_new);
        assert!(session.is_temporary());
    }

    #[tokio::test]
    async fn unknown_requested_id_creates_a_fresh_session() {
        let store = SessionStore::new(24);
        let session = store
            .get_or_create(1, Path::new("/w"), Some("missing"))
            .await;
        assert!(session.is_new);
        assert_ne!(session.session_id, "missing");
    }

    #[tokio::test]
    async fn temporary_sessions_are_rekeyed_on_first_completion() {
        let store = SessionStore::new(24);
        let session = store.get_or_create(1, Path::new("/w"), None).await;

        let updated = store
            .update(&session.session_id, &response("agent-id-1", 0.25))
            .await
            .unwrap();
        assert_eq!(updated.session_id, "agent-id-1");
        assert!(!updated.is_new);
        assert_eq!(updated.message_count, 1);
        assert!(updated.tools_used.contains("read"));

        // The old temporary key is gone; the new key resolves.
        assert!(store.get(&session.session_id).await.is_none());
        assert!(store.get("agent-id-1").await.is_some());
    }

    #[tokio::test]
    async fn costs_accumulate_across_updates() {
        let store = SessionStore::new(24);
        let session = store.get_or_create(1, Path::new("/w"), None).await;
        store
            .update(&session.session_id, &response("S", 0.25))
            .await
            .unwrap();
        let updated = store.update("S", &response("S", 0.50)).await.unwrap();
        assert_eq!(updated.message_count, 2);
        assert!((updated.total_cost - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn resumed_sessions_are_returned_for_their_owner_only() {
        let store = SessionStore::new(24);
        let session = store.get_or_create(1, Path::new("/w"), None).await;
        store
            .update(&session.session_id, &response("S", 0.0))
            .await
            .unwrap();

        let resumed = store.get_or_create(1, Path::new("/w"), Some("S")).await;
        assert_eq!(resumed.session_id, "S");
        assert!(!resumed.is_new);

        // Another user asking for the same id gets a fresh session.
        let other = store.get_or_create(2, Path::new("/w"), Some("S")).await;
        assert!(other.is_new);
    }

    #[tokio::test]
    async fn listing_orders_by_recency_and_continue_skips_temp_sessions() {
        let store = SessionStore::new(24);
        let first = store.get_or_create(1, Path::new("/w"), None).await;
        store
            .update(&first.session_id, &response("older", 0.0))
            .await
            .unwrap();
        let second = store.get_or_create(1, Path::new("/w"), None).await;
        store
            .update(&second.session_id, &response("newer", 0.0))
            .await
            .unwrap();
        // A dangling temporary session should never win.
        store.get_or_create(1, Path::new("/w"), None).await;

        let listed = store.list_user_sessions(1).await;
        assert_eq!(listed.len(), 3);

        let latest = store.most_recent_for(1, Path::new("/w")).await.unwrap();
        assert_eq!(latest.session_id, "newer");

        assert!(store.most_recent_for(1, Path::new("/elsewhere")).await.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let store = SessionStore::new(0);
        let session = store.get_or_create(1, Path::new("/w"), None).await;
        store
            .update(&session.session_id, &response("S", 0.0))
            .await
            .unwrap();

        // timeout of zero hours: anything already used is expired.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let removed = store.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert!(store.get("S").await.is_none());
    }
}
