use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::{AuthProvider, Session};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 255, message = "Username is required"))]
    #[schema(example = "alice")]
    pub username: String,

    #[validate(length(min = 1, max = 128, message = "Password is required"))]
    #[schema(example = "correct horse battery")]
    pub password: String,

    #[schema(example = "042917")]
    pub otp_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpRequiredResponse {
    #[schema(example = true)]
    pub requires_otp: bool,
    #[schema(example = "alice@example.com")]
    pub email: String,
    #[schema(example = "A verification code has been sent to your email")]
    pub message: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(length(min = 1, message = "Invitation token is required"))]
    pub token: String,

    #[schema(example = "local")]
    pub provider: AuthProvider,

    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    #[schema(example = "alice")]
    pub username: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    #[schema(example = "correct horse battery", min_length = 8, max_length = 128)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonatorInfo {
    pub id: Uuid,
    pub username: String,
}

/// Caller identity as seen through the current session.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub is_super_admin: bool,
    pub can_impersonate: bool,
    pub expires_at: DateTime<Utc>,
    pub is_impersonated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonator: Option<ImpersonatorInfo>,
}

impl From<Session> for MeResponse {
    fn from(s: Session) -> Self {
        let impersonator = s
            .impersonator
            .filter(|_| s.is_impersonated)
            .map(|i| ImpersonatorInfo {
                id: i.user_id,
                username: i.username,
            });
        Self {
            id: s.user_id,
            username: s.username,
            email: s.email,
            is_super_admin: s.is_super_admin,
            can_impersonate: s.can_impersonate,
            expires_at: s.expires_at,
            is_impersonated: s.is_impersonated,
            impersonator,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "Logged out")]
    pub message: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct OAuthLoginQuery {
    /// Invitation token, required for first-time sign-in.
    pub invitation: Option<String>,
    #[serde(default)]
    pub register: bool,
    #[serde(default)]
    pub force: bool,
    pub email_hint: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}
