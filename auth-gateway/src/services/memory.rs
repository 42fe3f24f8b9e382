//! In-process store for tests and single-node development.
//!
//! Mirrors the Postgres uniqueness rules (case-insensitive username/email,
//! one open impersonation per impersonator and per target) under one mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::repository::{
    decode_capabilities, AccessRepository, GatewayStore, ImpersonationRepository,
    InvitationRepository, OtpRepository, UserRepository,
};
use super::GatewayError;
use crate::models::{
    Application, AuthProvider, CapabilitySet, EndReason, ImpersonationAuditLog,
    ImpersonationSession, Invitation, OtpAttempt, Role, User,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    applications: HashMap<Uuid, Application>,
    roles: HashMap<Uuid, Role>,
    user_roles: Vec<(Uuid, Uuid)>,
    invitations: HashMap<Uuid, Invitation>,
    otps: Vec<OtpAttempt>,
    impersonations: HashMap<Uuid, ImpersonationSession>,
    audit_logs: Vec<ImpersonationAuditLog>,
}

impl MemoryState {
    fn check_user_unique(&self, user: &User) -> Result<(), GatewayError> {
        for existing in self.users.values() {
            if existing.username.eq_ignore_ascii_case(&user.username) {
                return Err(GatewayError::UsernameTaken);
            }
            if existing.email.eq_ignore_ascii_case(&user.email) {
                return Err(GatewayError::EmailTaken);
            }
            if user.provider_subject.is_some()
                && existing.provider_code == user.provider_code
                && existing.provider_subject == user.provider_subject
            {
                return Err(GatewayError::EmailTaken);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    access_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, GatewayError> {
        self.state
            .lock()
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    pub fn insert_application(&self, application: Application) -> Result<(), GatewayError> {
        self.lock()?
            .applications
            .insert(application.application_id, application);
        Ok(())
    }

    pub fn insert_role(&self, role: Role) -> Result<(), GatewayError> {
        self.lock()?.roles.insert(role.role_id, role);
        Ok(())
    }

    pub fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        if !state.user_roles.contains(&(user_id, role_id)) {
            state.user_roles.push((user_id, role_id));
        }
        Ok(())
    }

    pub fn set_application_active(&self, slug: &str, active: bool) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        for app in state.applications.values_mut() {
            if app.slug == slug {
                app.is_active = active;
            }
        }
        Ok(())
    }

    pub fn user_role_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, GatewayError> {
        Ok(self
            .lock()?
            .user_roles
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, r)| *r)
            .collect())
    }

    /// Number of RBAC lookups answered so far.
    pub fn access_queries(&self) -> usize {
        self.access_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, GatewayError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, GatewayError> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, GatewayError> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_provider(
        &self,
        provider: AuthProvider,
        subject: &str,
    ) -> Result<Option<User>, GatewayError> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| {
                u.provider_code == provider.as_str()
                    && u.provider_subject.as_deref() == Some(subject)
            })
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        state.check_user_unique(user)?;
        state.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn touch_last_login(&self, user_id: Uuid) -> Result<(), GatewayError> {
        if let Some(user) = self.lock()?.users.get_mut(&user_id) {
            user.last_login_utc = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<bool, GatewayError> {
        let mut state = self.lock()?;
        let existed = state.users.remove(&user_id).is_some();
        state.user_roles.retain(|(u, _)| *u != user_id);
        state
            .impersonations
            .retain(|_, s| s.impersonator_id != user_id && s.target_user_id != user_id);
        Ok(existed)
    }
}

#[async_trait]
impl InvitationRepository for MemoryStore {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), GatewayError> {
        self.lock()?
            .invitations
            .insert(invitation.invitation_id, invitation.clone());
        Ok(())
    }

    async fn find_invitation_by_token(
        &self,
        token: &str,
    ) -> Result<Option<Invitation>, GatewayError> {
        Ok(self
            .lock()?
            .invitations
            .values()
            .find(|i| i.token == token)
            .cloned())
    }

    async fn register_with_invitation(
        &self,
        user: &User,
        invitation_id: Uuid,
    ) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let role_ids = match state.invitations.get(&invitation_id) {
            Some(inv) if inv.is_redeemable(now) => inv.role_ids.clone(),
            _ => return Err(GatewayError::InvalidInvitation),
        };
        state.check_user_unique(user)?;

        state.users.insert(user.user_id, user.clone());
        if let Some(inv) = state.invitations.get_mut(&invitation_id) {
            inv.used_utc = Some(now);
            inv.used_by_user_id = Some(user.user_id);
        }
        for role_id in role_ids {
            if state.roles.contains_key(&role_id) && !state.user_roles.contains(&(user.user_id, role_id)) {
                state.user_roles.push((user.user_id, role_id));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OtpRepository for MemoryStore {
    async fn invalidate_otps(&self, email: &str) -> Result<u64, GatewayError> {
        let now = Utc::now();
        let mut count = 0;
        for otp in self.lock()?.otps.iter_mut() {
            if otp.email.eq_ignore_ascii_case(email) && otp.used_utc.is_none() {
                otp.used_utc = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_otp(&self, otp: &OtpAttempt) -> Result<(), GatewayError> {
        self.lock()?.otps.push(otp.clone());
        Ok(())
    }

    async fn latest_otp(&self, email: &str) -> Result<Option<OtpAttempt>, GatewayError> {
        // max_by_key keeps the last maximum, so same-instant ties go to the newest insert.
        Ok(self
            .lock()?
            .otps
            .iter()
            .filter(|o| o.email.eq_ignore_ascii_case(email))
            .max_by_key(|o| o.created_utc)
            .cloned())
    }

    async fn consume_otp(&self, otp_id: Uuid) -> Result<bool, GatewayError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        match state.otps.iter_mut().find(|o| o.otp_id == otp_id) {
            Some(otp) if otp.is_valid(now) => {
                otp.used_utc = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_otp_failure(&self, otp_id: Uuid, max_failures: i32) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        if let Some(otp) = state
            .otps
            .iter_mut()
            .find(|o| o.otp_id == otp_id && o.used_utc.is_none())
        {
            otp.failed_attempts += 1;
            if otp.failed_attempts >= max_failures {
                otp.used_utc = Some(Utc::now());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AccessRepository for MemoryStore {
    async fn has_application_access(
        &self,
        user_id: Uuid,
        slug: &str,
    ) -> Result<bool, GatewayError> {
        self.access_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock()?;
        Ok(state
            .user_roles
            .iter()
            .filter(|(u, _)| *u == user_id)
            .filter_map(|(_, r)| state.roles.get(r))
            .filter_map(|role| state.applications.get(&role.application_id))
            .any(|app| app.is_active && app.slug == slug))
    }

    async fn user_capabilities(&self, user_id: Uuid) -> Result<CapabilitySet, GatewayError> {
        let state = self.lock()?;
        Ok(state
            .user_roles
            .iter()
            .filter(|(u, _)| *u == user_id)
            .filter_map(|(_, r)| state.roles.get(r))
            .filter(|role| {
                state
                    .applications
                    .get(&role.application_id)
                    .map(|app| app.is_active)
                    .unwrap_or(false)
            })
            .map(|role| decode_capabilities(&role.permissions))
            .fold(CapabilitySet::default(), CapabilitySet::union))
    }
}

#[async_trait]
impl ImpersonationRepository for MemoryStore {
    async fn insert_impersonation(
        &self,
        session: &ImpersonationSession,
    ) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        for open in state.impersonations.values().filter(|s| s.ended_utc.is_none()) {
            if open.impersonator_id == session.impersonator_id {
                return Err(GatewayError::AlreadyImpersonating);
            }
            if open.target_user_id == session.target_user_id {
                return Err(GatewayError::TargetAlreadyImpersonated);
            }
        }
        state
            .impersonations
            .insert(session.impersonation_id, session.clone());
        Ok(())
    }

    async fn set_impersonated_session_key(
        &self,
        impersonation_id: Uuid,
        session_key: &str,
    ) -> Result<(), GatewayError> {
        if let Some(session) = self.lock()?.impersonations.get_mut(&impersonation_id) {
            session.impersonated_session_key = Some(session_key.to_string());
        }
        Ok(())
    }

    async fn find_impersonation(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(self.lock()?.impersonations.get(&impersonation_id).cloned())
    }

    async fn find_active_by_impersonator(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(self
            .lock()?
            .impersonations
            .values()
            .find(|s| s.impersonator_id == user_id && s.ended_utc.is_none())
            .cloned())
    }

    async fn find_active_by_target(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(self
            .lock()?
            .impersonations
            .values()
            .find(|s| s.target_user_id == user_id && s.ended_utc.is_none())
            .cloned())
    }

    async fn end_impersonation(
        &self,
        impersonation_id: Uuid,
        reason: EndReason,
        ended_by: Option<Uuid>,
    ) -> Result<bool, GatewayError> {
        let mut state = self.lock()?;
        match state.impersonations.get_mut(&impersonation_id) {
            Some(session) if session.ended_utc.is_none() => {
                session.ended_utc = Some(Utc::now());
                session.end_reason = Some(reason.as_str().to_string());
                session.ended_by_user_id = ended_by;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_impersonations(
        &self,
    ) -> Result<Vec<ImpersonationSession>, GatewayError> {
        let mut active: Vec<_> = self
            .lock()?
            .impersonations
            .values()
            .filter(|s| s.ended_utc.is_none())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.started_utc.cmp(&a.started_utc));
        Ok(active)
    }

    async fn expire_impersonations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImpersonationSession>, GatewayError> {
        let mut expired = Vec::new();
        for session in self.lock()?.impersonations.values_mut() {
            if session.ended_utc.is_none() && session.expiry_utc <= now {
                session.ended_utc = Some(now);
                session.end_reason = Some(EndReason::Expired.as_str().to_string());
                expired.push(session.clone());
            }
        }
        Ok(expired)
    }

    async fn insert_audit_log(&self, entry: &ImpersonationAuditLog) -> Result<(), GatewayError> {
        self.lock()?.audit_logs.push(entry.clone());
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Vec<ImpersonationAuditLog>, GatewayError> {
        Ok(self
            .lock()?
            .audit_logs
            .iter()
            .filter(|e| e.impersonation_id == impersonation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn health_check(&self) -> Result<(), GatewayError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvitationProvider;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_usernames_unique_case_insensitive() {
        let store = MemoryStore::new();
        store
            .insert_user(&User::new_local("Alice".into(), "a@x.com".into(), "h".into()))
            .await
            .unwrap();
        let err = store
            .insert_user(&User::new_local("alice".into(), "b@x.com".into(), "h".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UsernameTaken));
    }

    #[tokio::test]
    async fn test_invitation_redeemed_once_under_contention() {
        let store = Arc::new(MemoryStore::new());
        let inv = Invitation::new(
            "a@x.com".into(),
            InvitationProvider::Local,
            vec![],
            Duration::days(1),
            None,
        );
        store.insert_invitation(&inv).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..2 {
            let store = store.clone();
            let invitation_id = inv.invitation_id;
            handles.push(tokio::spawn(async move {
                let user = User::new_local(format!("user{}", i), format!("u{}@x.com", i), "h".into());
                store.register_with_invitation(&user, invitation_id).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(GatewayError::InvalidInvitation) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        let stored = store.find_invitation_by_token(&inv.token).await.unwrap().unwrap();
        assert!(stored.used_utc.is_some());
    }

    #[tokio::test]
    async fn test_second_open_impersonation_for_target_rejected() {
        let store = MemoryStore::new();
        let target = Uuid::new_v4();
        let expiry = Utc::now() + Duration::minutes(30);
        store
            .insert_impersonation(&ImpersonationSession::new(
                Uuid::new_v4(), "k1".into(), target, "r".into(), expiry, None, None,
            ))
            .await
            .unwrap();
        let err = store
            .insert_impersonation(&ImpersonationSession::new(
                Uuid::new_v4(), "k2".into(), target, "r".into(), expiry, None, None,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TargetAlreadyImpersonated));
    }
}
