use async_trait::async_trait;
use serde::Deserialize;

use super::{
    fetch_json, request_tokens, with_query, AuthorizationParams, ExternalProfile, OAuthProvider,
    OAuthTokens,
};
use crate::config::OAuthClientConfig;
use crate::models::AuthProvider;
use crate::services::GatewayError;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    name: Option<String>,
}

pub struct GoogleProvider {
    config: OAuthClientConfig,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(config: OAuthClientConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn kind(&self) -> AuthProvider {
        AuthProvider::Google
    }

    fn build_authorization_url(&self, params: &AuthorizationParams<'_>) -> String {
        let state = params.state();
        let prompt = if params.is_registration {
            "consent"
        } else if params.force_login {
            "login"
        } else {
            "select_account"
        };

        let mut query = vec![
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", "openid email profile"),
            ("access_type", "online"),
            ("state", state.as_str()),
            ("prompt", prompt),
        ];
        if let Some(hint) = params.email_hint.filter(|h| !h.is_empty()) {
            query.push(("login_hint", hint));
        }
        with_query(AUTHORIZE_URL, &query)
    }

    async fn exchange_code(&self, code: &str) -> Option<OAuthTokens> {
        request_tokens(
            &self.client,
            AuthProvider::Google,
            TOKEN_URL,
            &[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ],
        )
        .await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, GatewayError> {
        let info: GoogleUserInfo =
            fetch_json(&self.client, AuthProvider::Google, USERINFO_URL, access_token).await?;

        let email = info.email.ok_or_else(|| {
            tracing::warn!("Google profile carried no email");
            GatewayError::ProviderAuthFailed
        })?;

        Ok(ExternalProfile {
            provider_id: info.sub,
            email,
            email_verified: info.email_verified,
            name: info.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GoogleProvider {
        GoogleProvider::new(
            OAuthClientConfig {
                client_id: "cid".into(),
                client_secret: "secret".into(),
                redirect_uri: "https://auth.example.test/cb".into(),
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_default_prompt_selects_account() {
        let url = provider().build_authorization_url(&AuthorizationParams {
            nonce: "n1",
            ..Default::default()
        });
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fauth.example.test%2Fcb"));
        assert!(url.contains("state=n1&"));
        assert!(url.contains("prompt=select_account"));
        assert!(!url.contains("login_hint"));
        assert!(!url.contains("secret"));
    }

    #[test]
    fn test_registration_asks_for_consent_with_hint() {
        let url = provider().build_authorization_url(&AuthorizationParams {
            nonce: "n1",
            invitation_token: Some("tok"),
            is_registration: true,
            email_hint: Some("new@example.com"),
            ..Default::default()
        });
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=n1%7Ctok"));
        assert!(url.contains("login_hint=new%40example.com"));
    }

    #[test]
    fn test_force_login() {
        let url = provider().build_authorization_url(&AuthorizationParams {
            nonce: "n1",
            force_login: true,
            ..Default::default()
        });
        assert!(url.contains("prompt=login"));
    }

    #[test]
    fn test_userinfo_without_verification_flag_is_unverified() {
        let info: GoogleUserInfo =
            serde_json::from_str(r#"{"sub":"1","email":"a@example.com"}"#).unwrap();
        assert!(!info.email_verified);
    }
}
