use async_trait::async_trait;
use serde::Deserialize;

use super::{
    fetch_json, request_tokens, with_query, AuthorizationParams, ExternalProfile, OAuthProvider,
    OAuthTokens,
};
use crate::config::MicrosoftOAuthConfig;
use crate::models::AuthProvider;
use crate::services::GatewayError;

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const USERINFO_URL: &str = "https://graph.microsoft.com/oidc/userinfo";
const SCOPE: &str = "openid email profile";

/// Graph's OIDC userinfo. It has no `email_verified` claim; an email that is
/// present is one the tenant vouches for.
#[derive(Debug, Deserialize)]
struct MicrosoftUserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
}

pub struct MicrosoftProvider {
    config: MicrosoftOAuthConfig,
    client: reqwest::Client,
}

impl MicrosoftProvider {
    pub fn new(config: MicrosoftOAuthConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{}", LOGIN_BASE, self.config.tenant, name)
    }
}

#[async_trait]
impl OAuthProvider for MicrosoftProvider {
    fn kind(&self) -> AuthProvider {
        AuthProvider::Microsoft
    }

    fn build_authorization_url(&self, params: &AuthorizationParams<'_>) -> String {
        let state = params.state();
        let mut query = vec![
            ("client_id", self.config.client.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", self.config.client.redirect_uri.as_str()),
            ("response_mode", "query"),
            ("scope", SCOPE),
            ("state", state.as_str()),
        ];
        if params.is_registration {
            query.push(("prompt", "select_account"));
        } else if params.force_login {
            query.push(("prompt", "login"));
        }
        if let Some(hint) = params.email_hint.filter(|h| !h.is_empty()) {
            query.push(("login_hint", hint));
        }
        with_query(&self.endpoint("authorize"), &query)
    }

    async fn exchange_code(&self, code: &str) -> Option<OAuthTokens> {
        request_tokens(
            &self.client,
            AuthProvider::Microsoft,
            &self.endpoint("token"),
            &[
                ("client_id", self.config.client.client_id.as_str()),
                ("client_secret", self.config.client.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.config.client.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
                ("scope", SCOPE),
            ],
        )
        .await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, GatewayError> {
        let info: MicrosoftUserInfo =
            fetch_json(&self.client, AuthProvider::Microsoft, USERINFO_URL, access_token).await?;

        let email = info.email.filter(|e| !e.is_empty()).ok_or_else(|| {
            tracing::warn!("Microsoft profile carried no email");
            GatewayError::ProviderAuthFailed
        })?;

        Ok(ExternalProfile {
            provider_id: info.sub,
            email,
            email_verified: true,
            name: info.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthClientConfig;

    fn provider() -> MicrosoftProvider {
        MicrosoftProvider::new(
            MicrosoftOAuthConfig {
                client: OAuthClientConfig {
                    client_id: "ms-cid".into(),
                    client_secret: "ms-secret".into(),
                    redirect_uri: "https://auth.example.test/ms".into(),
                },
                tenant: "contoso".into(),
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_tenant_scoped_endpoints() {
        let p = provider();
        assert_eq!(
            p.endpoint("token"),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        let url = p.build_authorization_url(&AuthorizationParams {
            nonce: "n",
            ..Default::default()
        });
        assert!(url.starts_with("https://login.microsoftonline.com/contoso/oauth2/v2.0/authorize?"));
        assert!(!url.contains("prompt="));
    }

    #[test]
    fn test_prompt_mapping() {
        let p = provider();
        let force = p.build_authorization_url(&AuthorizationParams {
            nonce: "n",
            force_login: true,
            email_hint: Some("x@contoso.com"),
            ..Default::default()
        });
        assert!(force.contains("prompt=login"));
        assert!(force.contains("login_hint=x%40contoso.com"));

        let register = p.build_authorization_url(&AuthorizationParams {
            nonce: "n",
            is_registration: true,
            ..Default::default()
        });
        assert!(register.contains("prompt=select_account"));
    }
}
