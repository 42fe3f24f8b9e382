//! Opaque session lifecycle on top of a [`SessionBackend`].

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::redis::SessionBackend;
use super::GatewayError;
use crate::models::{Impersonator, Session, User};
use crate::utils::generate_token;
use service_core::observability::redact;

pub const SESSION_KEY_PREFIX: &str = "session:";

/// Client details recorded on a session.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

enum Lookup {
    Live(Session),
    Missing,
    Stale,
}

#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, lifetime_seconds: i64) -> Self {
        Self {
            backend,
            lifetime: Duration::seconds(lifetime_seconds),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, key)
    }

    async fn put(&self, key: &str, session: &Session, ttl_seconds: i64) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(session)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("Failed to encode session: {}", e)))?;
        self.backend
            .set_with_ttl(&Self::storage_key(key), &payload, ttl_seconds.max(1) as u64)
            .await
            .map_err(GatewayError::Store)
    }

    /// Issue a regular session for `user` with the configured lifetime.
    #[tracing::instrument(skip(self, user, client), fields(user_id = %user.user_id))]
    pub async fn create_session(
        &self,
        user: &User,
        can_impersonate: bool,
        client: &ClientInfo,
    ) -> Result<String, GatewayError> {
        let now = Utc::now();
        let key = generate_token();
        let session = Session {
            user_id: user.user_id,
            username: user.username.clone(),
            email: user.email.clone(),
            is_super_admin: user.is_super_admin,
            can_impersonate,
            expires_at: now + self.lifetime,
            created_at: now,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            is_impersonated: false,
            impersonator: None,
            impersonation_id: None,
            impersonation_expires_at: None,
        };

        self.put(&key, &session, self.lifetime.num_seconds()).await?;
        tracing::debug!(session = %redact(&key), "Session created");
        Ok(key)
    }

    /// Issue a session acting as `target` that dies at `expires_at`.
    ///
    /// Impersonated sessions never carry impersonation rights themselves.
    #[tracing::instrument(skip(self, target, impersonator, client), fields(target_id = %target.user_id))]
    pub async fn create_impersonated_session(
        &self,
        target: &User,
        impersonator: Impersonator,
        impersonation_id: Uuid,
        expires_at: DateTime<Utc>,
        client: &ClientInfo,
    ) -> Result<String, GatewayError> {
        let now = Utc::now();
        let ttl = (expires_at - now).num_seconds();
        if ttl <= 0 {
            return Err(GatewayError::InvalidInput(
                "impersonation window has already closed".to_string(),
            ));
        }

        let key = generate_token();
        let session = Session {
            user_id: target.user_id,
            username: target.username.clone(),
            email: target.email.clone(),
            is_super_admin: target.is_super_admin,
            can_impersonate: false,
            expires_at,
            created_at: now,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            is_impersonated: true,
            impersonator: Some(impersonator),
            impersonation_id: Some(impersonation_id),
            impersonation_expires_at: Some(expires_at),
        };

        self.put(&key, &session, ttl).await?;
        Ok(key)
    }

    /// Live session for `key`. Records past `expires_at` are deleted and
    /// reported as absent; so are records that no longer parse.
    pub async fn get_session(&self, key: &str) -> Result<Option<Session>, GatewayError> {
        match self.lookup(key).await? {
            Lookup::Live(session) => Ok(Some(session)),
            Lookup::Missing => Ok(None),
            Lookup::Stale => {
                self.backend
                    .delete(&Self::storage_key(key))
                    .await
                    .map_err(GatewayError::Store)?;
                Ok(None)
            }
        }
    }

    /// Same answer as [`SessionStore::get_session`] without the cleanup:
    /// stale records stay until the backend TTL reaps them.
    pub async fn peek_session(&self, key: &str) -> Result<Option<Session>, GatewayError> {
        match self.lookup(key).await? {
            Lookup::Live(session) => Ok(Some(session)),
            Lookup::Missing | Lookup::Stale => Ok(None),
        }
    }

    async fn lookup(&self, key: &str) -> Result<Lookup, GatewayError> {
        if key.is_empty() {
            return Ok(Lookup::Missing);
        }
        let Some(raw) = self
            .backend
            .get(&Self::storage_key(key))
            .await
            .map_err(GatewayError::Store)?
        else {
            return Ok(Lookup::Missing);
        };

        match serde_json::from_str::<Session>(&raw) {
            Ok(session) if session.is_expired_at(Utc::now()) => Ok(Lookup::Stale),
            Ok(session) => Ok(Lookup::Live(session)),
            Err(e) => {
                tracing::warn!(session = %redact(key), error = %e, "Unreadable session record");
                Ok(Lookup::Stale)
            }
        }
    }

    /// Returns `true` if a session was removed.
    pub async fn invalidate_session(&self, key: &str) -> Result<bool, GatewayError> {
        self.backend
            .delete(&Self::storage_key(key))
            .await
            .map_err(GatewayError::Store)
    }

    /// Remove every session belonging to `user_id`, impersonated ones included.
    #[tracing::instrument(skip(self))]
    pub async fn delete_sessions_for_user(&self, user_id: Uuid) -> Result<u64, GatewayError> {
        let keys = self
            .backend
            .scan_keys(SESSION_KEY_PREFIX)
            .await
            .map_err(GatewayError::Store)?;

        let mut removed = 0;
        for storage_key in keys {
            let Some(raw) = self
                .backend
                .get(&storage_key)
                .await
                .map_err(GatewayError::Store)?
            else {
                continue;
            };
            let belongs = serde_json::from_str::<Session>(&raw)
                .map(|s| s.user_id == user_id)
                .unwrap_or(false);
            if belongs
                && self
                    .backend
                    .delete(&storage_key)
                    .await
                    .map_err(GatewayError::Store)?
            {
                removed += 1;
            }
        }

        tracing::info!(removed, "Deleted sessions for user");
        Ok(removed)
    }

    pub async fn health_check(&self) -> Result<(), GatewayError> {
        self.backend.health_check().await.map_err(GatewayError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::redis::MemorySessionBackend;

    fn store() -> (SessionStore, Arc<MemorySessionBackend>) {
        let backend = Arc::new(MemorySessionBackend::new());
        (SessionStore::new(backend.clone(), 4 * 60 * 60), backend)
    }

    fn user(name: &str) -> User {
        User::new_local(name.into(), format!("{}@example.com", name), "hash".into())
    }

    #[tokio::test]
    async fn test_created_session_round_trips_until_ttl() {
        let (store, backend) = store();
        let alice = user("alice");
        let key = store
            .create_session(&alice, false, &ClientInfo::default())
            .await
            .unwrap();

        assert_eq!(key.len(), 64);
        let session = store.get_session(&key).await.unwrap().unwrap();
        assert_eq!(session.user_id, alice.user_id);
        assert!(session.expires_at > Utc::now());

        backend.expire_now(&format!("{}{}", SESSION_KEY_PREFIX, key));
        assert!(store.get_session(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_past_expiry_is_treated_as_absent() {
        let (store, backend) = store();
        let alice = user("alice");
        let now = Utc::now();
        let stale = Session {
            user_id: alice.user_id,
            username: alice.username.clone(),
            email: alice.email.clone(),
            is_super_admin: false,
            can_impersonate: false,
            expires_at: now - Duration::minutes(1),
            created_at: now - Duration::hours(4),
            ip_address: None,
            user_agent: None,
            is_impersonated: false,
            impersonator: None,
            impersonation_id: None,
            impersonation_expires_at: None,
        };
        backend
            .set_with_ttl("session:stale", &serde_json::to_string(&stale).unwrap(), 600)
            .await
            .unwrap();

        assert!(store.peek_session("stale").await.unwrap().is_none());
        assert!(backend.get("session:stale").await.unwrap().is_some());

        assert!(store.get_session("stale").await.unwrap().is_none());
        assert!(backend.get("session:stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peek_leaves_unreadable_records_alone() {
        let (store, backend) = store();
        backend.set_with_ttl("session:junk", "not json", 600).await.unwrap();

        assert!(store.peek_session("junk").await.unwrap().is_none());
        assert!(backend.get("session:junk").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_impersonated_session_requires_open_window() {
        let (store, _) = store();
        let target = user("bob");
        let impersonator = Impersonator {
            user_id: Uuid::new_v4(),
            username: "admin".into(),
            original_session_key: "orig".into(),
        };

        let err = store
            .create_impersonated_session(
                &target,
                impersonator.clone(),
                Uuid::new_v4(),
                Utc::now() - Duration::seconds(1),
                &ClientInfo::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));

        let key = store
            .create_impersonated_session(
                &target,
                impersonator,
                Uuid::new_v4(),
                Utc::now() + Duration::minutes(30),
                &ClientInfo::default(),
            )
            .await
            .unwrap();
        let session = store.get_session(&key).await.unwrap().unwrap();
        assert!(session.is_impersonated);
        assert!(!session.can_impersonate);
        assert_eq!(session.impersonator.unwrap().original_session_key, "orig");
    }

    #[tokio::test]
    async fn test_delete_sessions_for_user_only_touches_that_user() {
        let (store, _) = store();
        let alice = user("alice");
        let bob = user("bob");
        let a1 = store.create_session(&alice, false, &ClientInfo::default()).await.unwrap();
        let a2 = store.create_session(&alice, false, &ClientInfo::default()).await.unwrap();
        let b1 = store.create_session(&bob, false, &ClientInfo::default()).await.unwrap();

        assert_eq!(store.delete_sessions_for_user(alice.user_id).await.unwrap(), 2);
        assert!(store.get_session(&a1).await.unwrap().is_none());
        assert!(store.get_session(&a2).await.unwrap().is_none());
        assert!(store.get_session(&b1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_reports_whether_removed() {
        let (store, _) = store();
        let key = store
            .create_session(&user("alice"), false, &ClientInfo::default())
            .await
            .unwrap();
        assert!(store.invalidate_session(&key).await.unwrap());
        assert!(!store.invalidate_session(&key).await.unwrap());
    }
}
