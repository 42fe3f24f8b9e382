//! Local username/password login with an emailed one-time code.

use chrono::{Duration, Utc};
use std::sync::Arc;

use super::notification::Notifier;
use super::repository::{AccessRepository, GatewayStore, OtpRepository, UserRepository};
use super::session::{ClientInfo, SessionStore};
use super::GatewayError;
use crate::config::OtpConfig;
use crate::models::{OtpAttempt, User, MAX_OTP_FAILURES};
use crate::utils::{
    constant_time_eq, generate_numeric_code, sha256_hex, verify_dummy, verify_password, Password,
};

#[derive(Debug)]
pub enum LoginOutcome {
    /// Password accepted; a code was sent to `email`.
    OtpRequired { email: String },
    Authenticated { user: User, session_key: String },
}

/// Record the login on `user` and issue a regular session for it.
///
/// `canImpersonate` on the session is the union of the account flag, the
/// super-admin bit and the `impersonate` capability from the user's roles.
pub(crate) async fn issue_login_session(
    store: &dyn GatewayStore,
    sessions: &SessionStore,
    mut user: User,
    client: &ClientInfo,
) -> Result<(User, String), GatewayError> {
    store.touch_last_login(user.user_id).await?;
    user.last_login_utc = Some(Utc::now());

    let capabilities = store.user_capabilities(user.user_id).await?;
    let can_impersonate = user.is_super_admin || user.can_impersonate || capabilities.impersonate;
    let key = sessions.create_session(&user, can_impersonate, client).await?;

    tracing::info!(user_id = %user.user_id, provider = %user.provider(), "User logged in");
    Ok((user, key))
}

#[derive(Clone)]
pub struct CredentialService {
    store: Arc<dyn GatewayStore>,
    sessions: SessionStore,
    notifier: Arc<dyn Notifier>,
    otp: OtpConfig,
}

impl CredentialService {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        sessions: SessionStore,
        notifier: Arc<dyn Notifier>,
        otp: OtpConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            otp,
        }
    }

    /// Run the local login state machine.
    ///
    /// Without `otp_code` (and with OTP enabled) a fresh code is issued and
    /// `OtpRequired` returned; submitting the code completes the login.
    #[tracing::instrument(skip(self, password, otp_code, client))]
    pub async fn login(
        &self,
        username: &str,
        password: &Password,
        otp_code: Option<&str>,
        client: &ClientInfo,
    ) -> Result<LoginOutcome, GatewayError> {
        let user = self.check_credentials(username, password).await?;

        if self.otp.enabled {
            match otp_code.map(str::trim).filter(|c| !c.is_empty()) {
                None => {
                    self.issue_otp(&user.email).await?;
                    return Ok(LoginOutcome::OtpRequired { email: user.email });
                }
                Some(code) => self.verify_otp(&user.email, code).await?,
            }
        }

        let (user, session_key) =
            issue_login_session(self.store.as_ref(), &self.sessions, user, client).await?;
        Ok(LoginOutcome::Authenticated { user, session_key })
    }

    /// Every failure path runs one argon2 verification and returns the same
    /// error.
    async fn check_credentials(
        &self,
        username: &str,
        password: &Password,
    ) -> Result<User, GatewayError> {
        let user = self.store.find_user_by_username(username.trim()).await?;

        let verified = match &user {
            Some(u) if u.is_active && u.is_local() => match u.password_hash.as_deref() {
                Some(hash) => verify_password(password, hash),
                None => {
                    verify_dummy(password);
                    false
                }
            },
            _ => {
                verify_dummy(password);
                false
            }
        };

        match user {
            Some(user) if verified => Ok(user),
            _ => {
                tracing::warn!("Login failed: invalid credentials");
                Err(GatewayError::InvalidCredentials)
            }
        }
    }

    /// Replace any outstanding code for `email` with a fresh one and queue it
    /// for delivery.
    pub async fn issue_otp(&self, email: &str) -> Result<(), GatewayError> {
        let superseded = self.store.invalidate_otps(email).await?;

        let code = generate_numeric_code();
        let attempt = OtpAttempt::new(
            email.to_string(),
            sha256_hex(code.as_bytes()),
            Duration::minutes(self.otp.ttl_minutes),
        );
        self.store.insert_otp(&attempt).await?;

        let body = format!(
            "Your sign-in code is {}.\n\nIt expires in {} minutes. If you did not try to sign in, you can ignore this message.",
            code, self.otp.ttl_minutes
        );
        self.notifier.enqueue(email, "Your sign-in code", &body)?;

        tracing::info!(superseded, "Issued one-time code");
        Ok(())
    }

    /// Consume the latest code for `email` if `code` matches it.
    pub async fn verify_otp(&self, email: &str, code: &str) -> Result<(), GatewayError> {
        let Some(latest) = self.store.latest_otp(email).await? else {
            return Err(GatewayError::InvalidOtp);
        };

        if !latest.is_valid(Utc::now()) {
            tracing::warn!("One-time code expired or already used");
            return Err(GatewayError::InvalidOtp);
        }
        if !constant_time_eq(&sha256_hex(code.as_bytes()), &latest.code_hash) {
            self.store
                .record_otp_failure(latest.otp_id, MAX_OTP_FAILURES)
                .await?;
            tracing::warn!(failed_attempts = latest.failed_attempts + 1, "One-time code rejected");
            return Err(GatewayError::InvalidOtp);
        }

        if !self.store.consume_otp(latest.otp_id).await? {
            tracing::warn!("One-time code already consumed");
            return Err(GatewayError::InvalidOtp);
        }
        Ok(())
    }
}
