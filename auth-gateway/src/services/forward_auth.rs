//! "Who is this and may they reach this host?" for the reverse proxy.
//!
//! Read-only: a decision never writes to any store. Stale sessions are left
//! for the backend TTL to reap.

use std::sync::Arc;
use uuid::Uuid;

use super::metrics;
use super::repository::{AccessRepository, GatewayStore};
use super::session::SessionStore;
use super::GatewayError;
use crate::models::Session;

pub const HEADER_USER: &str = "X-Auth-User";
pub const HEADER_EMAIL: &str = "X-Auth-Email";
pub const HEADER_SESSION: &str = "X-Auth-Session";
pub const HEADER_IS_ADMIN: &str = "X-Auth-Is-Admin";
pub const HEADER_IMPERSONATOR: &str = "X-Auth-Impersonator";

/// Identity handed to the upstream application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHeaders {
    pub user: String,
    pub email: String,
    pub session: String,
    pub is_admin: bool,
    pub impersonator: Option<String>,
}

impl IdentityHeaders {
    fn from_session(key: &str, session: &Session) -> Self {
        Self {
            user: session.username.clone(),
            email: session.email.clone(),
            session: key.to_string(),
            is_admin: session.is_super_admin,
            impersonator: session
                .impersonator
                .as_ref()
                .filter(|_| session.is_impersonated)
                .map(|i| i.username.clone()),
        }
    }

    /// Header name/value pairs in a stable order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (HEADER_USER, self.user.clone()),
            (HEADER_EMAIL, self.email.clone()),
            (HEADER_SESSION, self.session.clone()),
            (HEADER_IS_ADMIN, self.is_admin.to_string()),
        ];
        if let Some(impersonator) = &self.impersonator {
            pairs.push((HEADER_IMPERSONATOR, impersonator.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Unauthenticated,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(IdentityHeaders),
    Deny(DenyReason),
}

/// A decision plus the impersonation it was made under, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub impersonation_id: Option<Uuid>,
}

impl Verdict {
    fn anonymous(decision: Decision) -> Self {
        Self {
            decision,
            impersonation_id: None,
        }
    }

    fn for_session(session: &Session, decision: Decision) -> Self {
        Self {
            decision,
            impersonation_id: session
                .impersonation_id
                .filter(|_| session.is_impersonated),
        }
    }
}

impl Decision {
    fn label(&self) -> &'static str {
        match self {
            Decision::Allow(_) => "allow",
            Decision::Deny(DenyReason::Unauthenticated) => "unauthenticated",
            Decision::Deny(DenyReason::Forbidden) => "forbidden",
        }
    }
}

/// Application slug for a forwarded host: the lowercase first DNS label with
/// any port removed. `wiki.example.com:8443` gives `wiki`.
pub fn target_from_host(host: &str) -> Option<String> {
    let host = host.split(',').next().unwrap_or_default().trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let label = without_port.split('.').next().unwrap_or_default().trim();
    if label.is_empty() {
        None
    } else {
        Some(label.to_ascii_lowercase())
    }
}

#[derive(Clone)]
pub struct ForwardAuthService {
    store: Arc<dyn GatewayStore>,
    sessions: SessionStore,
}

impl ForwardAuthService {
    pub fn new(store: Arc<dyn GatewayStore>, sessions: SessionStore) -> Self {
        Self { store, sessions }
    }

    #[tracing::instrument(skip_all, fields(host = forwarded_host.unwrap_or("")))]
    pub async fn decide(
        &self,
        session_key: Option<&str>,
        forwarded_host: Option<&str>,
    ) -> Result<Verdict, GatewayError> {
        let verdict = self.evaluate(session_key, forwarded_host).await?;
        metrics::record_forward_auth(verdict.decision.label());
        tracing::debug!(decision = verdict.decision.label(), "Forward-auth decision");
        Ok(verdict)
    }

    async fn evaluate(
        &self,
        session_key: Option<&str>,
        forwarded_host: Option<&str>,
    ) -> Result<Verdict, GatewayError> {
        let Some(key) = session_key.filter(|k| !k.is_empty()) else {
            return Ok(Verdict::anonymous(Decision::Deny(DenyReason::Unauthenticated)));
        };
        let Some(session) = self.sessions.peek_session(key).await? else {
            return Ok(Verdict::anonymous(Decision::Deny(DenyReason::Unauthenticated)));
        };

        if session.is_super_admin {
            let identity = IdentityHeaders::from_session(key, &session);
            return Ok(Verdict::for_session(&session, Decision::Allow(identity)));
        }

        let Some(slug) = forwarded_host.and_then(target_from_host) else {
            return Ok(Verdict::for_session(&session, Decision::Deny(DenyReason::Forbidden)));
        };

        let decision = if self
            .store
            .has_application_access(session.user_id, &slug)
            .await?
        {
            Decision::Allow(IdentityHeaders::from_session(key, &session))
        } else {
            tracing::info!(user_id = %session.user_id, slug = %slug, "No role on target application");
            Decision::Deny(DenyReason::Forbidden)
        };
        Ok(Verdict::for_session(&session, decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_host() {
        assert_eq!(target_from_host("wiki.example.com").as_deref(), Some("wiki"));
        assert_eq!(target_from_host("Wiki.Example.com:8443").as_deref(), Some("wiki"));
        assert_eq!(target_from_host("grafana:3000").as_deref(), Some("grafana"));
        assert_eq!(target_from_host("docs.example.com, proxy.internal").as_deref(), Some("docs"));
        assert_eq!(target_from_host(""), None);
        assert_eq!(target_from_host(".example.com"), None);
    }

    #[test]
    fn test_impersonator_header_only_when_impersonated() {
        let headers = IdentityHeaders {
            user: "bob".into(),
            email: "bob@example.com".into(),
            session: "k".into(),
            is_admin: false,
            impersonator: None,
        };
        let names: Vec<_> = headers.pairs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![HEADER_USER, HEADER_EMAIL, HEADER_SESSION, HEADER_IS_ADMIN]);

        let impersonated = IdentityHeaders {
            impersonator: Some("admin".into()),
            ..headers
        };
        assert_eq!(impersonated.pairs().last().unwrap().1, "admin");
    }
}
