use std::collections::HashMap;

use tokio::sync::RwLock;

/// A user's connected Instagram business account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSession {
    pub user_id: String,
    pub ig_business_id: String,
    pub access_token: String,
    /// Consumed by the external auto-reply pipeline; this server only stores and reports it.
    pub auto_reply: bool,
}

/// Live channel sessions keyed by owning user.
///
/// At most one session per user and one owner per business id. Registering
/// replaces the user's previous session and evicts any other user holding the
/// same business id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, ChannelSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `session` and returns the one it replaced, if any.
    pub async fn register(&self, session: ChannelSession) -> Option<ChannelSession> {
        tracing::info!(
            user_id = %session.user_id,
            ig_business_id = %session.ig_business_id,
            auto_reply = session.auto_reply,
            "channel session registered"
        );
        let mut sessions = self.sessions.write().await;
        sessions.retain(|user_id, existing| {
            let conflict =
                *user_id != session.user_id && existing.ig_business_id == session.ig_business_id;
            if conflict {
                tracing::warn!(
                    user_id = %user_id,
                    ig_business_id = %existing.ig_business_id,
                    "channel session evicted by another user"
                );
            }
            !conflict
        });
        sessions.insert(session.user_id.clone(), session)
    }

    pub async fn remove(&self, user_id: &str) -> Option<ChannelSession> {
        let removed = self.sessions.write().await.remove(user_id);
        if removed.is_some() {
            tracing::info!(user_id, "channel session removed");
        }
        removed
    }

    pub async fn get(&self, user_id: &str) -> Option<ChannelSession> {
        self.sessions.read().await.get(user_id).cloned()
    }

    /// Owner of the session connected to `ig_business_id`.
    pub async fn find_by_business_id(&self, ig_business_id: &str) -> Option<ChannelSession> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.ig_business_id == ig_business_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str, business: &str) -> ChannelSession {
        ChannelSession {
            user_id: user.to_string(),
            ig_business_id: business.to_string(),
            access_token: format!("token-{user}"),
            auto_reply: false,
        }
    }

    #[tokio::test]
    async fn register_replaces_and_remove_tears_down() {
        let registry = SessionRegistry::new();
        assert!(registry.register(session("u1", "ig-1")).await.is_none());

        let replaced = registry.register(session("u1", "ig-2")).await;
        assert_eq!(replaced.map(|s| s.ig_business_id).as_deref(), Some("ig-1"));
        assert_eq!(
            registry.get("u1").await.map(|s| s.ig_business_id).as_deref(),
            Some("ig-2")
        );

        assert!(registry.remove("u1").await.is_some());
        assert!(registry.get("u1").await.is_none());
        assert!(registry.remove("u1").await.is_none());
    }

    #[tokio::test]
    async fn business_id_has_a_single_owner() {
        let registry = SessionRegistry::new();
        registry.register(session("u1", "ig-1")).await;
        registry.register(session("u2", "ig-1")).await;

        let owner = registry.find_by_business_id("ig-1").await;
        assert_eq!(owner.map(|s| s.user_id).as_deref(), Some("u2"));
        assert!(registry.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn business_id_lookup_finds_owner() {
        let registry = SessionRegistry::new();
        registry.register(session("u1", "ig-1")).await;
        registry.register(session("u2", "ig-2")).await;

        let owner = registry.find_by_business_id("ig-2").await;
        assert_eq!(owner.map(|s| s.user_id).as_deref(), Some("u2"));
        assert!(registry.find_by_business_id("ig-3").await.is_none());
    }
}
