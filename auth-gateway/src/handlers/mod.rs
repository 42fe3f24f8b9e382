//! HTTP handlers for the auth gateway.

pub mod admin;
pub mod auth;
pub mod cookies;
pub mod forward_auth;
pub mod impersonation;
pub mod metrics;
pub mod oauth;

pub use admin::*;
pub use auth::*;
pub use forward_auth::*;
pub use impersonation::*;
pub use oauth::*;
