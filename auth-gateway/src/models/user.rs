//! User model - local and federated accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Where an account's credentials live. Fixed once the account exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Local,
    Google,
    Microsoft,
}

impl AuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProvider::Local => "local",
            AuthProvider::Google => "google",
            AuthProvider::Microsoft => "microsoft",
        }
    }
}

impl std::str::FromStr for AuthProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(AuthProvider::Local),
            "google" => Ok(AuthProvider::Google),
            "microsoft" => Ok(AuthProvider::Microsoft),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User entity.
///
/// Local accounts carry `password_hash`; federated accounts carry
/// `provider_subject` (the provider's stable user id). Never both.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub provider_code: String,
    pub provider_subject: Option<String>,
    pub is_super_admin: bool,
    pub can_impersonate: bool,
    pub is_active: bool,
    pub last_login_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl User {
    /// Create a local account.
    pub fn new_local(username: String, email: String, password_hash: String) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username,
            email,
            password_hash: Some(password_hash),
            provider_code: AuthProvider::Local.as_str().to_string(),
            provider_subject: None,
            is_super_admin: false,
            can_impersonate: false,
            is_active: true,
            last_login_utc: None,
            created_utc: Utc::now(),
        }
    }

    /// Create an account backed by an external identity provider.
    pub fn new_external(
        provider: AuthProvider,
        provider_subject: String,
        username: String,
        email: String,
    ) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username,
            email,
            password_hash: None,
            provider_code: provider.as_str().to_string(),
            provider_subject: Some(provider_subject),
            is_super_admin: false,
            can_impersonate: false,
            is_active: true,
            last_login_utc: None,
            created_utc: Utc::now(),
        }
    }

    /// Provider of this account; unknown codes are treated as local so a
    /// federated login can never claim them.
    pub fn provider(&self) -> AuthProvider {
        self.provider_code.parse().unwrap_or(AuthProvider::Local)
    }

    pub fn is_local(&self) -> bool {
        self.provider() == AuthProvider::Local
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile::from(self.clone())
    }
}

/// User as returned by the API (no credentials).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub provider: AuthProvider,
    pub is_super_admin: bool,
    pub can_impersonate: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<User> for UserProfile {
    fn from(u: User) -> Self {
        let provider = u.provider();
        Self {
            id: u.user_id,
            username: u.username,
            email: u.email,
            provider,
            is_super_admin: u.is_super_admin,
            can_impersonate: u.can_impersonate,
            last_login_at: u.last_login_utc,
        }
    }
}
