//! Persistence seams of the gateway.
//!
//! Each concern gets its own trait; `GatewayStore` bundles them so services
//! hold a single `Arc<dyn GatewayStore>`. Implemented by [`super::Database`]
//! (Postgres) and [`super::MemoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::GatewayError;
use crate::models::{
    AuthProvider, CapabilitySet, EndReason, ImpersonationAuditLog, ImpersonationSession,
    Invitation, OtpAttempt, User,
};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, GatewayError>;

    /// Case-insensitive.
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, GatewayError>;

    /// Case-insensitive.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, GatewayError>;

    async fn find_user_by_provider(
        &self,
        provider: AuthProvider,
        subject: &str,
    ) -> Result<Option<User>, GatewayError>;

    /// Fails with `UsernameTaken` / `EmailTaken` on a uniqueness conflict.
    async fn insert_user(&self, user: &User) -> Result<(), GatewayError>;

    async fn touch_last_login(&self, user_id: Uuid) -> Result<(), GatewayError>;

    /// Returns `false` when no such user existed.
    async fn delete_user(&self, user_id: Uuid) -> Result<bool, GatewayError>;
}

#[async_trait]
pub trait InvitationRepository: Send + Sync {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), GatewayError>;

    async fn find_invitation_by_token(
        &self,
        token: &str,
    ) -> Result<Option<Invitation>, GatewayError>;

    /// Atomically create `user`, claim the invitation and assign its roles.
    ///
    /// The claim only succeeds while the invitation is unused and unexpired;
    /// otherwise nothing is written and `InvalidInvitation` is returned.
    async fn register_with_invitation(
        &self,
        user: &User,
        invitation_id: Uuid,
    ) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait OtpRepository: Send + Sync {
    /// Mark every unused code for `email` as used. Returns how many were.
    async fn invalidate_otps(&self, email: &str) -> Result<u64, GatewayError>;

    async fn insert_otp(&self, otp: &OtpAttempt) -> Result<(), GatewayError>;

    /// Most recently created code for `email`, used or not.
    async fn latest_otp(&self, email: &str) -> Result<Option<OtpAttempt>, GatewayError>;

    /// Conditional consume: `true` only for the single caller that flipped
    /// `used_utc` from null while the code was unexpired.
    async fn consume_otp(&self, otp_id: Uuid) -> Result<bool, GatewayError>;

    /// Count a wrong guess against an unused code and burn it once
    /// `max_failures` is reached.
    async fn record_otp_failure(&self, otp_id: Uuid, max_failures: i32) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait AccessRepository: Send + Sync {
    /// Whether the user holds any role on the active application `slug`.
    async fn has_application_access(&self, user_id: Uuid, slug: &str)
        -> Result<bool, GatewayError>;

    /// Union of capabilities over the user's roles on active applications.
    async fn user_capabilities(&self, user_id: Uuid) -> Result<CapabilitySet, GatewayError>;
}

#[async_trait]
pub trait ImpersonationRepository: Send + Sync {
    /// Fails with `AlreadyImpersonating` / `TargetAlreadyImpersonated` when a
    /// concurrent start won the race.
    async fn insert_impersonation(&self, session: &ImpersonationSession)
        -> Result<(), GatewayError>;

    async fn set_impersonated_session_key(
        &self,
        impersonation_id: Uuid,
        session_key: &str,
    ) -> Result<(), GatewayError>;

    async fn find_impersonation(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError>;

    /// Not-yet-ended row where the user is the impersonator.
    async fn find_active_by_impersonator(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError>;

    /// Not-yet-ended row where the user is the target.
    async fn find_active_by_target(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError>;

    /// End the row if it is still open. Returns `false` if it had already ended.
    async fn end_impersonation(
        &self,
        impersonation_id: Uuid,
        reason: EndReason,
        ended_by: Option<Uuid>,
    ) -> Result<bool, GatewayError>;

    async fn list_active_impersonations(&self) -> Result<Vec<ImpersonationSession>, GatewayError>;

    /// End every open row whose expiry is at or before `now`; returns them.
    async fn expire_impersonations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImpersonationSession>, GatewayError>;

    async fn insert_audit_log(&self, entry: &ImpersonationAuditLog) -> Result<(), GatewayError>;

    async fn list_audit_logs(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Vec<ImpersonationAuditLog>, GatewayError>;
}

#[async_trait]
pub trait GatewayStore:
    UserRepository
    + InvitationRepository
    + OtpRepository
    + AccessRepository
    + ImpersonationRepository
    + Send
    + Sync
{
    async fn health_check(&self) -> Result<(), GatewayError>;
}

/// Decode a role's permission blob.
///
/// Accepts either a flag object (`{"impersonate": true}`) or a list of
/// capability names (`["admin"]`). Anything else grants nothing.
pub(crate) fn decode_capabilities(blob: &serde_json::Value) -> CapabilitySet {
    let flag = |name: &str| match blob {
        serde_json::Value::Object(map) => map
            .get(name)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .any(|item| item.eq_ignore_ascii_case(name)),
        _ => false,
    };

    CapabilitySet {
        impersonate: flag("impersonate"),
        admin: flag("admin"),
    }
}
