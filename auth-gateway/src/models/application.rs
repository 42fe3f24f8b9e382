//! Applications behind the proxy and the roles that grant access to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An application reachable through the reverse proxy. `slug` is matched
/// against the first label of the forwarded host.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Application {
    pub application_id: Uuid,
    pub slug: String,
    pub name: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Application {
    pub fn new(slug: &str, name: &str) -> Self {
        Self {
            application_id: Uuid::new_v4(),
            slug: slug.to_lowercase(),
            name: name.to_string(),
            is_active: true,
            created_utc: Utc::now(),
        }
    }
}

/// Role on one application. `permissions` is the raw JSONB blob.
#[derive(Debug, Clone, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub application_id: Uuid,
    pub name: String,
    pub permissions: serde_json::Value,
}

impl Role {
    pub fn new(application_id: Uuid, name: &str, permissions: serde_json::Value) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            application_id,
            name: name.to_string(),
            permissions,
        }
    }
}

/// Gateway-level capabilities granted through a user's roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub impersonate: bool,
    pub admin: bool,
}

impl CapabilitySet {
    pub fn union(self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet {
            impersonate: self.impersonate || other.impersonate,
            admin: self.admin || other.admin,
        }
    }
}
