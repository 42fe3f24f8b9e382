//! Invitation model - single-use registration grants with pre-assigned roles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::AuthProvider;
use crate::utils::tokens::generate_token;

/// Which provider an invitation may be redeemed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InvitationProvider {
    Any,
    Local,
    Google,
    Microsoft,
}

impl InvitationProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationProvider::Any => "any",
            InvitationProvider::Local => "local",
            InvitationProvider::Google => "google",
            InvitationProvider::Microsoft => "microsoft",
        }
    }

    pub fn permits(&self, provider: AuthProvider) -> bool {
        match self {
            InvitationProvider::Any => true,
            InvitationProvider::Local => provider == AuthProvider::Local,
            InvitationProvider::Google => provider == AuthProvider::Google,
            InvitationProvider::Microsoft => provider == AuthProvider::Microsoft,
        }
    }
}

impl std::str::FromStr for InvitationProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "any" => Ok(InvitationProvider::Any),
            "local" => Ok(InvitationProvider::Local),
            "google" => Ok(InvitationProvider::Google),
            "microsoft" => Ok(InvitationProvider::Microsoft),
            _ => Err(format!("Unknown invitation provider: {}", s)),
        }
    }
}

/// Invitation entity.
#[derive(Debug, Clone, FromRow)]
pub struct Invitation {
    pub invitation_id: Uuid,
    pub token: String,
    pub email: String,
    pub provider_code: String,
    pub role_ids: Vec<Uuid>,
    pub expiry_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
    pub used_by_user_id: Option<Uuid>,
    pub created_by_user_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Invitation {
    /// Create a new invitation with a fresh 256-bit token.
    pub fn new(
        email: String,
        provider: InvitationProvider,
        role_ids: Vec<Uuid>,
        valid_for: Duration,
        created_by_user_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            invitation_id: Uuid::new_v4(),
            token: generate_token(),
            email,
            provider_code: provider.as_str().to_string(),
            role_ids,
            expiry_utc: now + valid_for,
            used_utc: None,
            used_by_user_id: None,
            created_by_user_id,
            created_utc: now,
        }
    }

    /// Unknown codes permit nothing.
    pub fn permits(&self, provider: AuthProvider) -> bool {
        self.provider_code
            .parse::<InvitationProvider>()
            .map(|p| p.permits(provider))
            .unwrap_or(false)
    }

    /// Unused and unexpired.
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        self.used_utc.is_none() && now < self.expiry_utc
    }
}
