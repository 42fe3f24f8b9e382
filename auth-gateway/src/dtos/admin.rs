use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Invitation, InvitationProvider};

fn default_provider() -> InvitationProvider {
    InvitationProvider::Any
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvitationRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "new.hire@example.com")]
    pub email: String,

    #[serde(default = "default_provider")]
    pub provider: InvitationProvider,

    #[serde(default)]
    pub role_ids: Vec<Uuid>,

    #[validate(range(min = 1, max = 720, message = "Validity must be 1-720 hours"))]
    #[schema(example = 168)]
    pub valid_for_hours: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvitationResponse {
    pub id: Uuid,
    pub token: String,
    pub email: String,
    pub provider: String,
    pub role_ids: Vec<Uuid>,
    pub expires_at: DateTime<Utc>,
}

impl From<Invitation> for InvitationResponse {
    fn from(inv: Invitation) -> Self {
        Self {
            id: inv.invitation_id,
            token: inv.token,
            email: inv.email,
            provider: inv.provider_code,
            role_ids: inv.role_ids,
            expires_at: inv.expiry_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserResponse {
    pub id: Uuid,
    pub sessions_removed: u64,
    pub impersonations_revoked: u64,
}
