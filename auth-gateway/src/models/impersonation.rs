//! Impersonation sessions and their append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Manual,
    Expired,
    AdminRevoked,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Manual => "manual",
            EndReason::Expired => "expired",
            EndReason::AdminRevoked => "admin_revoked",
        }
    }
}

/// Impersonation session entity. Active while `ended_utc` is null.
#[derive(Debug, Clone, FromRow)]
pub struct ImpersonationSession {
    pub impersonation_id: Uuid,
    pub impersonator_id: Uuid,
    pub impersonator_session_key: String,
    pub target_user_id: Uuid,
    pub impersonated_session_key: Option<String>,
    pub reason: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub started_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub ended_utc: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub ended_by_user_id: Option<Uuid>,
}

impl ImpersonationSession {
    pub fn new(
        impersonator_id: Uuid,
        impersonator_session_key: String,
        target_user_id: Uuid,
        reason: String,
        expiry_utc: DateTime<Utc>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            impersonation_id: Uuid::new_v4(),
            impersonator_id,
            impersonator_session_key,
            target_user_id,
            impersonated_session_key: None,
            reason,
            ip_address,
            user_agent,
            started_utc: Utc::now(),
            expiry_utc,
            ended_utc: None,
            end_reason: None,
            ended_by_user_id: None,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.ended_utc.is_none() && now < self.expiry_utc
    }
}

/// Outcome class of a request made while impersonating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ApiCall,
    ClientError,
    ServerError,
    Error,
}

impl AuditAction {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => AuditAction::ApiCall,
            400..=499 => AuditAction::ClientError,
            500..=599 => AuditAction::ServerError,
            _ => AuditAction::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ApiCall => "api_call",
            AuditAction::ClientError => "client_error",
            AuditAction::ServerError => "server_error",
            AuditAction::Error => "error",
        }
    }
}

/// One audited request. Rows are never updated and outlive their session.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationAuditLog {
    pub audit_id: Uuid,
    pub impersonation_id: Uuid,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub http_method: String,
    pub endpoint: String,
    pub request_body_hash: Option<String>,
    pub response_status_code: Option<i32>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_classification() {
        assert_eq!(AuditAction::from_status(200), AuditAction::ApiCall);
        assert_eq!(AuditAction::from_status(302), AuditAction::ApiCall);
        assert_eq!(AuditAction::from_status(404), AuditAction::ClientError);
        assert_eq!(AuditAction::from_status(503), AuditAction::ServerError);
        assert_eq!(AuditAction::from_status(101), AuditAction::Error);
    }
}
