//! One live voice session and its lifecycle

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::protocol::{CloseReason, ConnectionState};

/// Side of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Upstream,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Upstream => write!(f, "upstream"),
        }
    }
}

/// Session lifecycle, derived from both legs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Opening,
    Active,
    Closing,
    Closed,
}

/// State of both legs plus the reason the session ended
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub client: ConnectionState,
    pub upstream: ConnectionState,
    /// First close reason wins
    pub close_reason: Option<CloseReason>,
}

impl SessionStatus {
    #[must_use]
    pub fn lifecycle(&self) -> SessionLifecycle {
        if self.client.is_terminal() && self.upstream.is_terminal() {
            return SessionLifecycle::Closed;
        }
        let winding_down = |state: &ConnectionState| {
            *state == ConnectionState::Closing || state.is_terminal()
        };
        if self.close_reason.is_some()
            || winding_down(&self.client)
            || winding_down(&self.upstream)
        {
            return SessionLifecycle::Closing;
        }
        if matches!(self.client, ConnectionState::Open)
            && matches!(self.upstream, ConnectionState::Open)
        {
            return SessionLifecycle::Active;
        }
        SessionLifecycle::Opening
    }

    fn leg_mut(&mut self, leg: Leg) -> &mut ConnectionState {
        match leg {
            Leg::Client => &mut self.client,
            Leg::Upstream => &mut self.upstream,
        }
    }
}

/// A live conversation between one client and one upstream connection
///
/// All lifecycle changes go through a single watch cell, so concurrent
/// teardown requests from either leg are linearized.
pub struct VoiceSession {
    pub id: Uuid,
    pub user_id: String,
    pub recipe_id: Uuid,
    pub version_id: Option<Uuid>,
    pub step_index: u32,
    pub created_at: DateTime<Utc>,
    status: watch::Sender<SessionStatus>,
}

impl VoiceSession {
    #[must_use]
    pub fn new(user_id: String, recipe_id: Uuid, version_id: Option<Uuid>, step_index: u32) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            client: ConnectionState::Connecting,
            upstream: ConnectionState::Connecting,
            close_reason: None,
        });
        Self {
            id: Uuid::new_v4(),
            user_id,
            recipe_id,
            version_id,
            step_index,
            created_at: Utc::now(),
            status,
        }
    }

    /// Snapshot of both legs
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn lifecycle(&self) -> SessionLifecycle {
        self.status.borrow().lifecycle()
    }

    /// Move one leg to a new state, ignoring illegal transitions
    pub fn mark_leg(&self, leg: Leg, next: ConnectionState) {
        self.status.send_if_modified(|status| {
            let current = status.leg_mut(leg);
            if current.can_transition_to(&next) {
                tracing::debug!(session_id = %self.id, %leg, from = %current, to = %next, "leg state");
                *current = next.clone();
                true
            } else {
                false
            }
        });
    }

    /// Begin teardown with `reason`
    ///
    /// Returns false if the session was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if status.close_reason.is_some() {
                return false;
            }
            for state in [&mut status.client, &mut status.upstream] {
                if !state.is_terminal() {
                    *state = ConnectionState::Closing;
                }
            }
            status.close_reason = Some(reason.clone());
            true
        });
        if changed {
            tracing::info!(
                session_id = %self.id,
                code = reason.code,
                reason = %reason.reason,
                "session closing"
            );
        }
        changed
    }

    /// Force both legs to a terminal state
    pub fn release(&self) {
        self.status.send_if_modified(|status| {
            let mut changed = false;
            for state in [&mut status.client, &mut status.upstream] {
                if !state.is_terminal() {
                    *state = ConnectionState::Closed;
                    changed = true;
                }
            }
            changed
        });
    }

    /// Resolves once teardown has started, with the close reason
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.status.subscribe();
        rx.wait_for(|s| s.close_reason.is_some())
            .await
            .ok()
            .and_then(|s| s.close_reason.clone())
            .unwrap_or_else(|| CloseReason::away("session dropped"))
    }

    /// Resolves once both legs are released
    pub async fn released(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx
            .wait_for(|s| s.lifecycle() == SessionLifecycle::Closed)
            .await;
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("recipe_id", &self.recipe_id)
            .field("version_id", &self.version_id)
            .field("step_index", &self.step_index)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn session() -> VoiceSession {
        VoiceSession::new("cook".to_string(), Uuid::new_v4(), None, 0)
    }

    #[test]
    fn lifecycle_follows_legs() {
        let s = session();
        assert_eq!(s.lifecycle(), SessionLifecycle::Opening);

        s.mark_leg(Leg::Client, ConnectionState::Open);
        assert_eq!(s.lifecycle(), SessionLifecycle::Opening);
        s.mark_leg(Leg::Upstream, ConnectionState::Open);
        assert_eq!(s.lifecycle(), SessionLifecycle::Active);

        assert!(s.close(CloseReason::normal("done")));
        assert_eq!(s.lifecycle(), SessionLifecycle::Closing);

        s.mark_leg(Leg::Client, ConnectionState::Closed);
        assert_eq!(s.lifecycle(), SessionLifecycle::Closing);
        s.mark_leg(Leg::Upstream, ConnectionState::Closed);
        assert_eq!(s.lifecycle(), SessionLifecycle::Closed);
    }

    #[test]
    fn close_is_idempotent_and_first_reason_wins() {
        let s = session();
        assert!(s.close(CloseReason::policy("first")));
        assert!(!s.close(CloseReason::internal("second")));
        assert_eq!(s.status().close_reason, Some(CloseReason::policy("first")));

        s.release();
        assert_eq!(s.lifecycle(), SessionLifecycle::Closed);
        assert!(!s.close(CloseReason::normal("late")));
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let s = session();
        s.mark_leg(Leg::Client, ConnectionState::Closed);
        assert_eq!(s.status().client, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn waiters_observe_close_and_release() {
        let s = Arc::new(session());

        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.closed().await })
        };
        let releaser = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.released().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        s.close(CloseReason::away("heartbeat timeout"));
        assert_eq!(waiter.await.unwrap(), CloseReason::away("heartbeat timeout"));

        s.release();
        tokio::time::timeout(Duration::from_secs(1), releaser)
            .await
            .unwrap()
            .unwrap();
    }
}
