//! Session persistence — backend trait plus the staleness-aware manager.
//!
//! `load` returns a fresh session unless a snapshot exists and is younger
//! than the restore ceiling (24h by default). Save failures are logged and
//! swallowed: the turn already ran against the in-memory session, so
//! persistence must never abort it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::SessionError;
use crate::session::model::Session;

/// A timestamped session snapshot.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub saved_at: DateTime<Utc>,
    pub session: Session,
}

/// Backend-agnostic session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, SessionError>;
    async fn save(&self, user_id: &str, snapshot: SessionSnapshot) -> Result<(), SessionError>;
}

/// In-memory backend.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionSnapshot>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, SessionError> {
        Ok(self.sessions.read().await.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, snapshot: SessionSnapshot) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .insert(user_id.to_string(), snapshot);
        Ok(())
    }
}

/// Wraps a [`SessionStore`] with the restore-staleness policy.
pub struct SessionManager {
    store: std::sync::Arc<dyn SessionStore>,
    restore_ceiling: Duration,
}

impl SessionManager {
    pub fn new(store: std::sync::Arc<dyn SessionStore>, restore_ceiling: Duration) -> Self {
        Self {
            store,
            restore_ceiling,
        }
    }

    /// Load the user's session, or a fresh one if none exists or the
    /// snapshot is older than the restore ceiling.
    pub async fn load(&self, user_id: &str) -> Session {
        self.load_at(user_id, Utc::now()).await
    }

    pub(crate) async fn load_at(&self, user_id: &str, now: DateTime<Utc>) -> Session {
        match self.store.load(user_id).await {
            Ok(Some(snapshot)) => {
                let age = (now - snapshot.saved_at).to_std().unwrap_or_default();
                if age <= self.restore_ceiling {
                    return snapshot.session;
                }
                tracing::info!(user = %user_id, age_secs = age.as_secs(), "Stale snapshot, starting fresh");
                Session::new(user_id)
            }
            Ok(None) => Session::new(user_id),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Session load failed, starting fresh");
                Session::new(user_id)
            }
        }
    }

    /// Persist the session. Failures are logged and swallowed.
    pub async fn save(&self, session: &Session) {
        let snapshot = SessionSnapshot {
            saved_at: Utc::now(),
            session: session.clone(),
        };
        if let Err(e) = self.store.save(&session.user_id, snapshot).await {
            tracing::warn!(user = %session.user_id, error = %e, "Session save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::step::OnboardingStep;
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn manager(store: Arc<dyn SessionStore>) -> SessionManager {
        SessionManager::new(store, Duration::from_secs(24 * 60 * 60))
    }

    #[tokio::test]
    async fn load_returns_fresh_session_for_unknown_user() {
        let manager = manager(Arc::new(InMemorySessionStore::new()));
        let session = manager.load("new-user").await;
        assert_eq!(session.current_step, OnboardingStep::Init);
        assert_eq!(session.user_id, "new-user");
    }

    #[tokio::test]
    async fn restore_within_ceiling_returns_saved_state() {
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager(store.clone());

        let mut session = Session::new("u1");
        session.current_step = OnboardingStep::VerifyBank;
        let saved_at = Utc::now();
        store
            .save(
                "u1",
                SessionSnapshot {
                    saved_at,
                    session,
                },
            )
            .await
            .unwrap();

        let restored = manager
            .load_at("u1", saved_at + TimeDelta::hours(23) + TimeDelta::minutes(59))
            .await;
        assert_eq!(restored.current_step, OnboardingStep::VerifyBank);
    }

    #[tokio::test]
    async fn restore_past_ceiling_returns_fresh_session() {
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager(store.clone());

        let mut session = Session::new("u1");
        session.current_step = OnboardingStep::VerifyBank;
        let saved_at = Utc::now();
        store
            .save("u1", SessionSnapshot { saved_at, session })
            .await
            .unwrap();

        let restored = manager
            .load_at("u1", saved_at + TimeDelta::hours(24) + TimeDelta::minutes(1))
            .await;
        assert_eq!(restored.current_step, OnboardingStep::Init);
    }

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, SessionError> {
            Err(SessionError::Load {
                user_id: user_id.into(),
                reason: "backend down".into(),
            })
        }
        async fn save(&self, user_id: &str, _: SessionSnapshot) -> Result<(), SessionError> {
            Err(SessionError::Save {
                user_id: user_id.into(),
                reason: "backend down".into(),
            })
        }
    }

    #[tokio::test]
    async fn save_failure_is_swallowed() {
        let manager = manager(Arc::new(FailingStore));
        let session = Session::new("u1");
        // Must not panic or propagate
        manager.save(&session).await;
    }

    #[tokio::test]
    async fn load_failure_yields_fresh_session() {
        let manager = manager(Arc::new(FailingStore));
        let session = manager.load("u1").await;
        assert_eq!(session.current_step, OnboardingStep::Init);
    }
}
