//! Time-boxed, audited impersonation of one user by another.
//!
//! A row in `impersonation_sessions` is the source of truth: it is open while
//! `ended_utc` is null. The impersonated browser session dies with it.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::notification::Notifier;
use super::repository::{AccessRepository, GatewayStore, ImpersonationRepository, UserRepository};
use super::session::{ClientInfo, SessionStore};
use super::GatewayError;
use crate::config::ImpersonationConfig;
use crate::models::{
    EndReason, ImpersonationAuditLog, ImpersonationSession, Impersonator, User,
};

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub impersonator_id: Uuid,
    pub impersonator_session_key: String,
    pub target_user_id: Uuid,
    pub reason: String,
    pub duration_minutes: Option<i64>,
    pub client: ClientInfo,
}

#[derive(Debug, Clone)]
pub struct StartedImpersonation {
    pub impersonation_id: Uuid,
    pub session_key: String,
    pub target: User,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EndedImpersonation {
    pub impersonation_id: Uuid,
    /// The impersonator's own session, if it is still alive.
    pub original_session_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImpersonationStatus {
    Inactive,
    Active {
        impersonation_id: Uuid,
        impersonator_id: Uuid,
        impersonator_username: String,
        target_user_id: Uuid,
        target_username: String,
        expires_at: DateTime<Utc>,
        remaining_seconds: i64,
    },
}

#[derive(Clone)]
pub struct ImpersonationService {
    store: Arc<dyn GatewayStore>,
    sessions: SessionStore,
    notifier: Arc<dyn Notifier>,
    config: ImpersonationConfig,
}

impl ImpersonationService {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        sessions: SessionStore,
        notifier: Arc<dyn Notifier>,
        config: ImpersonationConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            config,
        }
    }

    /// Requested duration clamped to `[1, max]`, defaulting when absent.
    pub fn clamp_minutes(&self, requested: Option<i64>) -> i64 {
        let max = self.config.max_minutes.max(1);
        requested
            .unwrap_or(self.config.default_minutes)
            .clamp(1, max)
    }

    /// Close a row that is still open but already past its expiry. Returns
    /// the row only when it is genuinely active.
    async fn still_active(
        &self,
        row: Option<ImpersonationSession>,
        now: DateTime<Utc>,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        match row {
            Some(row) if row.expiry_utc <= now => {
                self.store
                    .end_impersonation(row.impersonation_id, EndReason::Expired, None)
                    .await?;
                if let Some(key) = &row.impersonated_session_key {
                    self.sessions.invalidate_session(key).await?;
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    #[tracing::instrument(
        skip(self, request),
        fields(impersonator_id = %request.impersonator_id, target_id = %request.target_user_id)
    )]
    pub async fn start(&self, request: StartRequest) -> Result<StartedImpersonation, GatewayError> {
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(GatewayError::ReasonRequired);
        }
        if request.impersonator_id == request.target_user_id {
            return Err(GatewayError::SelfImpersonation);
        }

        let now = Utc::now();
        let own = self
            .store
            .find_active_by_impersonator(request.impersonator_id)
            .await?;
        if self.still_active(own, now).await?.is_some() {
            return Err(GatewayError::AlreadyImpersonating);
        }

        let target = match self.store.find_user_by_id(request.target_user_id).await? {
            Some(user) if user.is_active => user,
            _ => return Err(GatewayError::TargetUnavailable),
        };
        if target.is_super_admin {
            return Err(GatewayError::CannotImpersonateSuperAdmin);
        }

        let on_target = self.store.find_active_by_target(target.user_id).await?;
        if self.still_active(on_target, now).await?.is_some() {
            return Err(GatewayError::TargetAlreadyImpersonated);
        }

        let on_impersonator = self
            .store
            .find_active_by_target(request.impersonator_id)
            .await?;
        if self.still_active(on_impersonator, now).await?.is_some() {
            return Err(GatewayError::NoChaining);
        }

        let impersonator = match self.store.find_user_by_id(request.impersonator_id).await? {
            Some(user) if user.is_active => user,
            _ => return Err(GatewayError::ImpersonationNotPermitted),
        };
        self.check_permission(&impersonator, &target).await?;

        let minutes = self.clamp_minutes(request.duration_minutes);
        let expires_at = now + Duration::minutes(minutes);
        let row = ImpersonationSession::new(
            impersonator.user_id,
            request.impersonator_session_key.clone(),
            target.user_id,
            reason.to_string(),
            expires_at,
            request.client.ip_address.clone(),
            request.client.user_agent.clone(),
        );
        self.store.insert_impersonation(&row).await?;

        let session_key = match self
            .sessions
            .create_impersonated_session(
                &target,
                Impersonator {
                    user_id: impersonator.user_id,
                    username: impersonator.username.clone(),
                    original_session_key: request.impersonator_session_key.clone(),
                },
                row.impersonation_id,
                expires_at,
                &request.client,
            )
            .await
        {
            Ok(key) => key,
            Err(e) => {
                // Do not leave an open row without a session behind it.
                self.store
                    .end_impersonation(row.impersonation_id, EndReason::Manual, Some(impersonator.user_id))
                    .await?;
                return Err(e);
            }
        };
        self.store
            .set_impersonated_session_key(row.impersonation_id, &session_key)
            .await?;

        tracing::info!(
            impersonation_id = %row.impersonation_id,
            minutes,
            "Impersonation started"
        );

        if self.config.notify_target {
            let body = format!(
                "{} started a support session on your account for {} minutes.\n\nReason: {}",
                impersonator.username, minutes, reason
            );
            if let Err(e) = self
                .notifier
                .enqueue(&target.email, "Your account is being accessed by support", &body)
            {
                tracing::warn!(error = %e, "Failed to queue impersonation notice");
            }
        }

        Ok(StartedImpersonation {
            impersonation_id: row.impersonation_id,
            session_key,
            target,
            expires_at,
        })
    }

    /// Super-admins may impersonate anyone who is not a super-admin. Everyone
    /// else needs the impersonate right and cannot target an admin.
    async fn check_permission(&self, impersonator: &User, target: &User) -> Result<(), GatewayError> {
        if impersonator.is_super_admin {
            return Ok(());
        }

        let own = self.store.user_capabilities(impersonator.user_id).await?;
        if !(impersonator.can_impersonate || own.impersonate) {
            return Err(GatewayError::ImpersonationNotPermitted);
        }

        let theirs = self.store.user_capabilities(target.user_id).await?;
        if theirs.admin {
            return Err(GatewayError::ImpersonationNotPermitted);
        }
        Ok(())
    }

    /// End the impersonation behind `impersonated_session_key`.
    #[tracing::instrument(skip_all)]
    pub async fn end(
        &self,
        impersonated_session_key: &str,
        reason: EndReason,
    ) -> Result<EndedImpersonation, GatewayError> {
        let session = self
            .sessions
            .get_session(impersonated_session_key)
            .await?
            .ok_or(GatewayError::Unauthenticated)?;

        let (Some(impersonation_id), Some(impersonator), true) = (
            session.impersonation_id,
            session.impersonator.clone(),
            session.is_impersonated,
        ) else {
            return Err(GatewayError::InvalidInput(
                "session is not an impersonation".to_string(),
            ));
        };

        self.store
            .end_impersonation(impersonation_id, reason, Some(impersonator.user_id))
            .await?;
        self.sessions
            .invalidate_session(impersonated_session_key)
            .await?;

        let original_session_key = self
            .sessions
            .get_session(&impersonator.original_session_key)
            .await?
            .map(|_| impersonator.original_session_key);

        tracing::info!(impersonation_id = %impersonation_id, reason = reason.as_str(), "Impersonation ended");
        Ok(EndedImpersonation {
            impersonation_id,
            original_session_key,
        })
    }

    /// Revoke an impersonation by id, whether or not its session still exists.
    #[tracing::instrument(skip(self))]
    pub async fn force_end(&self, impersonation_id: Uuid, admin_id: Uuid) -> Result<(), GatewayError> {
        let row = self
            .store
            .find_impersonation(impersonation_id)
            .await?
            .ok_or(GatewayError::NotFound("Impersonation session"))?;

        if !self
            .store
            .end_impersonation(impersonation_id, EndReason::AdminRevoked, Some(admin_id))
            .await?
        {
            return Err(GatewayError::NotFound("Active impersonation session"));
        }
        if let Some(key) = &row.impersonated_session_key {
            self.sessions.invalidate_session(key).await?;
        }

        tracing::info!("Impersonation revoked by admin");
        Ok(())
    }

    /// Revoke every open impersonation involving `user_id` on either side.
    pub async fn revoke_for_user(&self, user_id: Uuid, admin_id: Uuid) -> Result<u64, GatewayError> {
        let mut revoked = 0;
        for row in [
            self.store.find_active_by_impersonator(user_id).await?,
            self.store.find_active_by_target(user_id).await?,
        ]
        .into_iter()
        .flatten()
        {
            if self
                .store
                .end_impersonation(row.impersonation_id, EndReason::AdminRevoked, Some(admin_id))
                .await?
            {
                revoked += 1;
            }
            if let Some(key) = &row.impersonated_session_key {
                self.sessions.invalidate_session(key).await?;
            }
        }
        Ok(revoked)
    }

    pub async fn status(&self, session_key: &str) -> Result<ImpersonationStatus, GatewayError> {
        let Some(session) = self.sessions.get_session(session_key).await? else {
            return Err(GatewayError::Unauthenticated);
        };
        let (Some(impersonation_id), Some(impersonator), true) = (
            session.impersonation_id,
            session.impersonator.clone(),
            session.is_impersonated,
        ) else {
            return Ok(ImpersonationStatus::Inactive);
        };

        let now = Utc::now();
        match self.active_impersonation(impersonation_id).await? {
            Some(row) => Ok(ImpersonationStatus::Active {
                impersonation_id,
                impersonator_id: impersonator.user_id,
                impersonator_username: impersonator.username,
                target_user_id: session.user_id,
                target_username: session.username,
                expires_at: row.expiry_utc,
                remaining_seconds: (row.expiry_utc - now).num_seconds().max(0),
            }),
            None => Ok(ImpersonationStatus::Inactive),
        }
    }

    /// The row for `impersonation_id` if it is open and unexpired.
    pub async fn active_impersonation(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(self
            .store
            .find_impersonation(impersonation_id)
            .await?
            .filter(|row| row.is_active_at(Utc::now())))
    }

    pub async fn list_active(&self) -> Result<Vec<ImpersonationSession>, GatewayError> {
        self.store.list_active_impersonations().await
    }

    pub async fn audit_trail(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Vec<ImpersonationAuditLog>, GatewayError> {
        self.store.list_audit_logs(impersonation_id).await
    }

    pub async fn record_audit(&self, entry: &ImpersonationAuditLog) -> Result<(), GatewayError> {
        self.store.insert_audit_log(entry).await
    }

    /// End every open row past its expiry and drop their sessions.
    pub async fn cleanup_expired(&self) -> Result<usize, GatewayError> {
        let expired = self.store.expire_impersonations(Utc::now()).await?;
        for row in &expired {
            if let Some(key) = &row.impersonated_session_key {
                self.sessions.invalidate_session(key).await?;
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired impersonation sessions closed");
        }
        Ok(expired.len())
    }
}

/// Run [`ImpersonationService::cleanup_expired`] every `interval` until
/// `shutdown` is cancelled.
pub fn spawn_cleanup_task(
    service: ImpersonationService,
    interval: StdDuration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Impersonation cleanup stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = service.cleanup_expired().await {
                        tracing::error!(error = %e, "Impersonation cleanup failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Application, Role};
    use crate::services::memory::MemoryStore;
    use crate::services::notification::RecordingNotifier;
    use crate::services::redis::MemorySessionBackend;

    struct Fixture {
        service: ImpersonationService,
        store: Arc<MemoryStore>,
        sessions: SessionStore,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(notify_target: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(Arc::new(MemorySessionBackend::new()), 3600);
        let notifier = Arc::new(RecordingNotifier::new());
        let service = ImpersonationService::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            ImpersonationConfig {
                default_minutes: 30,
                max_minutes: 60,
                cleanup_interval_seconds: 60,
                notify_target,
            },
        );
        Fixture {
            service,
            store,
            sessions,
            notifier,
        }
    }

    async fn user(store: &MemoryStore, name: &str, super_admin: bool) -> User {
        let mut user = User::new_local(name.into(), format!("{}@example.com", name), "hash".into());
        user.is_super_admin = super_admin;
        store.insert_user(&user).await.unwrap();
        user
    }

    async fn login(sessions: &SessionStore, user: &User) -> String {
        sessions
            .create_session(user, user.is_super_admin, &ClientInfo::default())
            .await
            .unwrap()
    }

    fn request(impersonator: &User, key: &str, target: Uuid) -> StartRequest {
        StartRequest {
            impersonator_id: impersonator.user_id,
            impersonator_session_key: key.to_string(),
            target_user_id: target,
            reason: "ticket 42".into(),
            duration_minutes: None,
            client: ClientInfo::default(),
        }
    }

    #[tokio::test]
    async fn test_duration_is_clamped() {
        let f = fixture(false);
        assert_eq!(f.service.clamp_minutes(None), 30);
        assert_eq!(f.service.clamp_minutes(Some(0)), 1);
        assert_eq!(f.service.clamp_minutes(Some(-5)), 1);
        assert_eq!(f.service.clamp_minutes(Some(500)), 60);
    }

    #[tokio::test]
    async fn test_rejections_in_order() {
        let f = fixture(false);
        let admin = user(&f.store, "admin", true).await;
        let other_admin = user(&f.store, "root", true).await;
        let key = login(&f.sessions, &admin).await;

        let mut blank = request(&admin, &key, other_admin.user_id);
        blank.reason = "   ".into();
        assert!(matches!(f.service.start(blank).await, Err(GatewayError::ReasonRequired)));

        assert!(matches!(
            f.service.start(request(&admin, &key, admin.user_id)).await,
            Err(GatewayError::SelfImpersonation)
        ));
        assert!(matches!(
            f.service.start(request(&admin, &key, Uuid::new_v4())).await,
            Err(GatewayError::TargetUnavailable)
        ));
        assert!(matches!(
            f.service.start(request(&admin, &key, other_admin.user_id)).await,
            Err(GatewayError::CannotImpersonateSuperAdmin)
        ));
    }

    #[tokio::test]
    async fn test_one_open_session_per_side() {
        let f = fixture(false);
        let admin = user(&f.store, "admin", true).await;
        let admin2 = user(&f.store, "admin2", true).await;
        let bob = user(&f.store, "bob", false).await;
        let carol = user(&f.store, "carol", false).await;
        let key = login(&f.sessions, &admin).await;
        let key2 = login(&f.sessions, &admin2).await;

        f.service.start(request(&admin, &key, bob.user_id)).await.unwrap();

        assert!(matches!(
            f.service.start(request(&admin, &key, carol.user_id)).await,
            Err(GatewayError::AlreadyImpersonating)
        ));
        assert!(matches!(
            f.service.start(request(&admin2, &key2, bob.user_id)).await,
            Err(GatewayError::TargetAlreadyImpersonated)
        ));
    }

    #[tokio::test]
    async fn test_current_target_cannot_impersonate() {
        let f = fixture(false);
        let admin = user(&f.store, "admin", true).await;
        let mut bob = User::new_local("bob".into(), "bob@example.com".into(), "hash".into());
        bob.can_impersonate = true;
        f.store.insert_user(&bob).await.unwrap();
        let carol = user(&f.store, "carol", false).await;

        let admin_key = login(&f.sessions, &admin).await;
        let bob_key = login(&f.sessions, &bob).await;
        f.service.start(request(&admin, &admin_key, bob.user_id)).await.unwrap();

        assert!(matches!(
            f.service.start(request(&bob, &bob_key, carol.user_id)).await,
            Err(GatewayError::NoChaining)
        ));
    }

    #[tokio::test]
    async fn test_permission_rules_for_non_super_admins() {
        let f = fixture(false);
        let support = user(&f.store, "support", false).await;
        let bob = user(&f.store, "bob", false).await;
        let boss = user(&f.store, "boss", false).await;
        let key = login(&f.sessions, &support).await;

        assert!(matches!(
            f.service.start(request(&support, &key, bob.user_id)).await,
            Err(GatewayError::ImpersonationNotPermitted)
        ));

        let app = Application::new("console", "Console");
        let helpdesk = Role::new(app.application_id, "helpdesk", serde_json::json!({"impersonate": true}));
        let admins = Role::new(app.application_id, "admins", serde_json::json!(["admin"]));
        f.store.insert_application(app).unwrap();
        f.store.insert_role(helpdesk.clone()).unwrap();
        f.store.insert_role(admins.clone()).unwrap();
        f.store.assign_role(support.user_id, helpdesk.role_id).unwrap();
        f.store.assign_role(boss.user_id, admins.role_id).unwrap();

        assert!(matches!(
            f.service.start(request(&support, &key, boss.user_id)).await,
            Err(GatewayError::ImpersonationNotPermitted)
        ));
        f.service.start(request(&support, &key, bob.user_id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_status_end_round_trip() {
        let f = fixture(true);
        let admin = user(&f.store, "admin", true).await;
        let bob = user(&f.store, "bob", false).await;
        let admin_key = login(&f.sessions, &admin).await;

        let mut req = request(&admin, &admin_key, bob.user_id);
        req.duration_minutes = Some(15);
        let started = f.service.start(req).await.unwrap();

        let session = f.sessions.get_session(&started.session_key).await.unwrap().unwrap();
        assert_eq!(session.user_id, bob.user_id);
        assert!(session.is_impersonated);
        assert!(session.remaining_seconds(Utc::now()) <= 15 * 60);

        let ImpersonationStatus::Active { remaining_seconds, impersonator_id, .. } =
            f.service.status(&started.session_key).await.unwrap()
        else {
            panic!("expected an active impersonation");
        };
        assert_eq!(impersonator_id, admin.user_id);
        assert!(remaining_seconds > 0 && remaining_seconds <= 15 * 60);
        assert_eq!(f.notifier.sent().len(), 1);

        let ended = f.service.end(&started.session_key, EndReason::Manual).await.unwrap();
        assert_eq!(ended.original_session_key.as_deref(), Some(admin_key.as_str()));
        assert!(f.sessions.get_session(&started.session_key).await.unwrap().is_none());
        assert!(f.service.list_active().await.unwrap().is_empty());
        assert_eq!(f.service.status(&admin_key).await.unwrap(), ImpersonationStatus::Inactive);
    }

    #[tokio::test]
    async fn test_force_end_without_session_and_cleanup() {
        let f = fixture(false);
        let admin = user(&f.store, "admin", true).await;
        let bob = user(&f.store, "bob", false).await;
        let carol = user(&f.store, "carol", false).await;
        let key = login(&f.sessions, &admin).await;

        let started = f.service.start(request(&admin, &key, bob.user_id)).await.unwrap();
        f.sessions.invalidate_session(&started.session_key).await.unwrap();
        f.service.force_end(started.impersonation_id, admin.user_id).await.unwrap();
        let row = f.store.find_impersonation(started.impersonation_id).await.unwrap().unwrap();
        assert_eq!(row.end_reason.as_deref(), Some("admin_revoked"));
        assert!(matches!(
            f.service.force_end(started.impersonation_id, admin.user_id).await,
            Err(GatewayError::NotFound(_))
        ));

        let stale = ImpersonationSession::new(
            admin.user_id,
            key.clone(),
            carol.user_id,
            "old".into(),
            Utc::now() - Duration::minutes(1),
            None,
            None,
        );
        f.store.insert_impersonation(&stale).await.unwrap();
        assert_eq!(f.service.cleanup_expired().await.unwrap(), 1);
        assert_eq!(f.service.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_open_row_does_not_block_start() {
        let f = fixture(false);
        let admin = user(&f.store, "admin", true).await;
        let bob = user(&f.store, "bob", false).await;
        let key = login(&f.sessions, &admin).await;

        let stale = ImpersonationSession::new(
            admin.user_id,
            key.clone(),
            bob.user_id,
            "old".into(),
            Utc::now() - Duration::seconds(1),
            None,
            None,
        );
        f.store.insert_impersonation(&stale).await.unwrap();

        f.service.start(request(&admin, &key, bob.user_id)).await.unwrap();
        let old = f.store.find_impersonation(stale.impersonation_id).await.unwrap().unwrap();
        assert_eq!(old.end_reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_cancel() {
        let f = fixture(false);
        let shutdown = CancellationToken::new();
        let handle = spawn_cleanup_task(f.service.clone(), StdDuration::from_millis(10), shutdown.clone());
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
