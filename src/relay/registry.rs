//! Live sessions, one per user

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::session::{SessionLifecycle, VoiceSession};

/// Summary of a live session for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub user_id: String,
    pub recipe_id: Uuid,
    pub step_index: u32,
    pub started_at: String,
}

/// Tracks the active session for each user
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<VoiceSession>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it displaced
    pub async fn register(&self, session: Arc<VoiceSession>) -> Option<Arc<VoiceSession>> {
        let mut sessions = self.sessions.write().await;
        sessions
            .insert(session.user_id.clone(), session)
            .filter(|previous| previous.lifecycle() != SessionLifecycle::Closed)
    }

    /// Remove a session if it is still the registered one for its user
    pub async fn remove(&self, session: &VoiceSession) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&session.user_id)
            .is_some_and(|current| current.id == session.id)
        {
            sessions.remove(&session.user_id);
        }
    }

    pub async fn get(&self, user_id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions.read().await.get(user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| SessionSummary {
                id: s.id,
                user_id: s.user_id.clone(),
                recipe_id: s.recipe_id,
                step_index: s.step_index,
                started_at: s.created_at.to_rfc3339(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str) -> Arc<VoiceSession> {
        Arc::new(VoiceSession::new(user.to_string(), Uuid::new_v4(), None, 0))
    }

    #[tokio::test]
    async fn register_returns_displaced_session() {
        let registry = SessionRegistry::new();
        let first = session("alice");
        let second = session("alice");

        assert!(registry.register(Arc::clone(&first)).await.is_none());
        let displaced = registry.register(Arc::clone(&second)).await.unwrap();
        assert_eq!(displaced.id, first.id);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_ignores_superseded_sessions() {
        let registry = SessionRegistry::new();
        let first = session("alice");
        let second = session("alice");
        registry.register(Arc::clone(&first)).await;
        registry.register(Arc::clone(&second)).await;

        // The displaced session's cleanup must not evict its successor
        registry.remove(&first).await;
        assert_eq!(registry.get("alice").await.unwrap().id, second.id);

        registry.remove(&second).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn users_are_independent() {
        let registry = SessionRegistry::new();
        registry.register(session("alice")).await;
        registry.register(session("bob")).await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.snapshot().await.len(), 2);
    }
}
