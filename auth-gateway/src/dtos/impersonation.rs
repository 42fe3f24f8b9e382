use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::auth::ImpersonatorInfo;
use crate::models::{ImpersonationSession, UserProfile};
use crate::services::ImpersonationStatus;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartImpersonationRequest {
    pub target_user_id: Uuid,

    #[validate(length(max = 1000, message = "Reason must be at most 1000 characters"))]
    #[schema(example = "Reproducing ticket #4821")]
    pub reason: String,

    #[schema(example = 30)]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartImpersonationResponse {
    pub impersonation_id: Uuid,
    pub target: UserProfile,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndImpersonationResponse {
    pub impersonation_id: Uuid,
    /// Whether the impersonator's own session was restored.
    pub restored: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationStatusResponse {
    pub is_impersonating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonator: Option<ImpersonatorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ImpersonatorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
}

impl From<ImpersonationStatus> for ImpersonationStatusResponse {
    fn from(status: ImpersonationStatus) -> Self {
        match status {
            ImpersonationStatus::Inactive => Self {
                is_impersonating: false,
                impersonation_id: None,
                impersonator: None,
                target: None,
                expires_at: None,
                remaining_seconds: None,
            },
            ImpersonationStatus::Active {
                impersonation_id,
                impersonator_id,
                impersonator_username,
                target_user_id,
                target_username,
                expires_at,
                remaining_seconds,
            } => Self {
                is_impersonating: true,
                impersonation_id: Some(impersonation_id),
                impersonator: Some(ImpersonatorInfo {
                    id: impersonator_id,
                    username: impersonator_username,
                }),
                target: Some(ImpersonatorInfo {
                    id: target_user_id,
                    username: target_username,
                }),
                expires_at: Some(expires_at),
                remaining_seconds: Some(remaining_seconds),
            },
        }
    }
}

/// Admin view of an impersonation row. Session keys are never exposed.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationSummary {
    pub id: Uuid,
    pub impersonator_id: Uuid,
    pub target_user_id: Uuid,
    pub reason: String,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl From<ImpersonationSession> for ImpersonationSummary {
    fn from(row: ImpersonationSession) -> Self {
        Self {
            id: row.impersonation_id,
            impersonator_id: row.impersonator_id,
            target_user_id: row.target_user_id,
            reason: row.reason,
            ip_address: row.ip_address,
            started_at: row.started_utc,
            expires_at: row.expiry_utc,
            ended_at: row.ended_utc,
            end_reason: row.end_reason,
        }
    }
}
