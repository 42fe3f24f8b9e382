use service_core::error::AppError;
use thiserror::Error;

/// Domain failures of the gateway.
///
/// Credential and OTP failures are deliberately indistinguishable to callers;
/// registration and impersonation failures name the exact rule that failed.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access denied")]
    Forbidden,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired verification code")]
    InvalidOtp,

    #[error("Invalid or expired invitation")]
    InvalidInvitation,

    #[error("This account is registered with a different sign-in provider")]
    ProviderMismatch,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Email already registered")]
    EmailTaken,

    #[error("A reason is required to start impersonation")]
    ReasonRequired,

    #[error("You cannot impersonate yourself")]
    SelfImpersonation,

    #[error("You already have an active impersonation session")]
    AlreadyImpersonating,

    #[error("Target user not found or inactive")]
    TargetUnavailable,

    #[error("Super admins cannot be impersonated")]
    CannotImpersonateSuperAdmin,

    #[error("Target user is already being impersonated")]
    TargetAlreadyImpersonated,

    #[error("A user who is being impersonated cannot impersonate others")]
    NoChaining,

    #[error("You are not permitted to impersonate this user")]
    ImpersonationNotPermitted,

    #[error("Failed to authenticate with provider")]
    ProviderAuthFailed,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Session store error: {0}")]
    Store(anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Store(anyhow::Error::new(err))
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::Unauthenticated
            | GatewayError::InvalidCredentials
            | GatewayError::InvalidOtp => AppError::Unauthorized(anyhow::anyhow!(message)),
            GatewayError::Forbidden => AppError::Forbidden(anyhow::anyhow!(message)),
            GatewayError::InvalidInvitation
            | GatewayError::ProviderMismatch
            | GatewayError::UsernameTaken
            | GatewayError::EmailTaken
            | GatewayError::ReasonRequired
            | GatewayError::SelfImpersonation
            | GatewayError::AlreadyImpersonating
            | GatewayError::TargetUnavailable
            | GatewayError::CannotImpersonateSuperAdmin
            | GatewayError::TargetAlreadyImpersonated
            | GatewayError::NoChaining
            | GatewayError::ImpersonationNotPermitted
            | GatewayError::InvalidInput(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            GatewayError::ProviderAuthFailed => AppError::BadGateway(message),
            GatewayError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(message)),
            GatewayError::Store(e) => AppError::InternalError(e),
            GatewayError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            GatewayError::Internal(e) => AppError::InternalError(e),
        }
    }
}
