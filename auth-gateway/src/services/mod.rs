//! Business logic of the gateway: sessions, logins, identity resolution,
//! forward-auth decisions and impersonation.

pub mod credentials;
mod database;
pub mod error;
pub mod forward_auth;
pub mod identity;
pub mod impersonation;
pub mod memory;
pub mod metrics;
pub mod notification;
pub mod oauth;
pub mod redis;
pub mod repository;
pub mod session;

pub use credentials::{CredentialService, LoginOutcome};
pub use database::Database;
pub use error::GatewayError;
pub use forward_auth::{Decision, DenyReason, ForwardAuthService, IdentityHeaders, Verdict};
pub use identity::IdentityService;
pub use impersonation::{
    spawn_cleanup_task, EndedImpersonation, ImpersonationService, ImpersonationStatus,
    StartRequest, StartedImpersonation,
};
pub use memory::MemoryStore;
pub use notification::{
    DeliveryError, EmailProvider, NotificationQueue, Notifier, RecordingNotifier, SmtpEmailProvider,
};
pub use oauth::{ExternalProfile, OAuthProvider, OAuthTokens, ProviderMap};
pub use self::redis::{MemorySessionBackend, RedisSessionBackend, SessionBackend};
pub use repository::{
    AccessRepository, GatewayStore, ImpersonationRepository, InvitationRepository,
    OtpRepository, UserRepository,
};
pub use session::{ClientInfo, SessionStore};
