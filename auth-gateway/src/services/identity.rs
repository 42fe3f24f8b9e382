//! Maps external and local identities onto gateway users.
//!
//! Accounts are only ever created by redeeming an invitation.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::credentials::issue_login_session;
use super::oauth::ExternalProfile;
use super::repository::{GatewayStore, InvitationRepository, UserRepository};
use super::session::{ClientInfo, SessionStore};
use super::GatewayError;
use crate::models::{AuthProvider, Invitation, InvitationProvider, User};
use crate::utils::{hash_password, Password};

#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn GatewayStore>,
    sessions: SessionStore,
}

impl IdentityService {
    pub fn new(store: Arc<dyn GatewayStore>, sessions: SessionStore) -> Self {
        Self { store, sessions }
    }

    /// Log in (or register through `invitation_token`) the owner of an
    /// external profile. Returns the user and a fresh session key.
    #[tracing::instrument(skip(self, profile, invitation_token, client), fields(provider = %provider))]
    pub async fn resolve_external(
        &self,
        provider: AuthProvider,
        profile: &ExternalProfile,
        invitation_token: Option<&str>,
        client: &ClientInfo,
    ) -> Result<(User, String), GatewayError> {
        if !profile.email_verified {
            tracing::warn!("Provider reported an unverified email");
            return Err(GatewayError::ProviderAuthFailed);
        }

        let existing = match self
            .store
            .find_user_by_provider(provider, &profile.provider_id)
            .await?
        {
            Some(user) => Some(user),
            None => self.store.find_user_by_email(&profile.email).await?,
        };

        if let Some(user) = existing {
            // Same email under another provider, or under another identity of
            // this provider, is not this account.
            if user.provider() != provider
                || user.provider_subject.as_deref() != Some(profile.provider_id.as_str())
            {
                tracing::warn!(user_id = %user.user_id, "Provider mismatch on external login");
                return Err(GatewayError::ProviderMismatch);
            }
            if !user.is_active {
                return Err(GatewayError::InvalidCredentials);
            }
            return issue_login_session(self.store.as_ref(), &self.sessions, user, client).await;
        }

        let invitation = self.redeemable_invitation(invitation_token, provider).await?;
        if !invitation.email.eq_ignore_ascii_case(&profile.email) {
            tracing::warn!(invitation_id = %invitation.invitation_id, "Invitation email does not match provider email");
            return Err(GatewayError::InvalidInvitation);
        }

        let user = User::new_external(
            provider,
            profile.provider_id.clone(),
            profile.email.to_lowercase(),
            profile.email.clone(),
        );
        self.store
            .register_with_invitation(&user, invitation.invitation_id)
            .await?;
        tracing::info!(user_id = %user.user_id, invitation_id = %invitation.invitation_id, "Registered external user");

        issue_login_session(self.store.as_ref(), &self.sessions, user, client).await
    }

    /// Create a local account from an invitation and log it in.
    #[tracing::instrument(skip(self, token, password, client))]
    pub async fn register_local(
        &self,
        token: &str,
        username: &str,
        password: &Password,
        client: &ClientInfo,
    ) -> Result<(User, String), GatewayError> {
        let invitation = self
            .redeemable_invitation(Some(token), AuthProvider::Local)
            .await?;

        let username = username.trim();
        if self.store.find_user_by_username(username).await?.is_some() {
            return Err(GatewayError::UsernameTaken);
        }
        if self.store.find_user_by_email(&invitation.email).await?.is_some() {
            return Err(GatewayError::EmailTaken);
        }

        let hash = hash_password(password)?;
        let user = User::new_local(username.to_string(), invitation.email.clone(), hash.into_string());
        self.store
            .register_with_invitation(&user, invitation.invitation_id)
            .await?;
        tracing::info!(user_id = %user.user_id, invitation_id = %invitation.invitation_id, "Registered local user");

        issue_login_session(self.store.as_ref(), &self.sessions, user, client).await
    }

    /// Issue a new invitation.
    #[tracing::instrument(skip(self, role_ids))]
    pub async fn create_invitation(
        &self,
        email: &str,
        provider: InvitationProvider,
        role_ids: Vec<Uuid>,
        valid_for: Duration,
        created_by: Uuid,
    ) -> Result<Invitation, GatewayError> {
        if valid_for <= Duration::zero() {
            return Err(GatewayError::InvalidInput(
                "invitation validity must be positive".to_string(),
            ));
        }
        let invitation = Invitation::new(
            email.trim().to_string(),
            provider,
            role_ids,
            valid_for,
            Some(created_by),
        );
        self.store.insert_invitation(&invitation).await?;
        tracing::info!(invitation_id = %invitation.invitation_id, "Invitation created");
        Ok(invitation)
    }

    async fn redeemable_invitation(
        &self,
        token: Option<&str>,
        provider: AuthProvider,
    ) -> Result<Invitation, GatewayError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::InvalidInvitation)?;

        match self.store.find_invitation_by_token(token).await? {
            Some(invitation) if invitation.is_redeemable(Utc::now()) && invitation.permits(provider) => {
                Ok(invitation)
            }
            _ => Err(GatewayError::InvalidInvitation),
        }
    }
}
