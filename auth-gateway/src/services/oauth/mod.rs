//! OAuth2 authorization-code adapters for external identity providers.

mod google;
mod microsoft;
pub mod state;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::GatewayError;
use crate::config::GatewayConfig;
use crate::models::AuthProvider;

pub use google::GoogleProvider;
pub use microsoft::MicrosoftProvider;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Token endpoint response; only what the gateway uses.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Identity asserted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProfile {
    pub provider_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: Option<String>,
}

/// Inputs to the authorization redirect.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationParams<'a> {
    pub nonce: &'a str,
    pub invitation_token: Option<&'a str>,
    pub force_login: bool,
    pub is_registration: bool,
    pub email_hint: Option<&'a str>,
}

impl AuthorizationParams<'_> {
    pub fn state(&self) -> String {
        state::encode(self.nonce, self.invitation_token)
    }
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn kind(&self) -> AuthProvider;

    fn build_authorization_url(&self, params: &AuthorizationParams<'_>) -> String;

    /// `None` on any failure; the cause is logged, never surfaced.
    async fn exchange_code(&self, code: &str) -> Option<OAuthTokens>;

    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, GatewayError>;
}

pub type ProviderMap = HashMap<AuthProvider, Arc<dyn OAuthProvider>>;

/// Shared client for provider calls. No retries.
pub fn http_client() -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("Failed to build HTTP client: {}", e)))
}

/// Providers with a configured client id.
pub fn build_providers(config: &GatewayConfig) -> Result<ProviderMap, GatewayError> {
    let client = http_client()?;
    let mut providers: ProviderMap = HashMap::new();

    if !config.google.client_id.is_empty() {
        providers.insert(
            AuthProvider::Google,
            Arc::new(GoogleProvider::new(config.google.clone(), client.clone())),
        );
    }
    if !config.microsoft.client.client_id.is_empty() {
        providers.insert(
            AuthProvider::Microsoft,
            Arc::new(MicrosoftProvider::new(config.microsoft.clone(), client)),
        );
    }

    tracing::info!(
        providers = ?providers.keys().map(AuthProvider::as_str).collect::<Vec<_>>(),
        "OAuth providers configured"
    );
    Ok(providers)
}

/// Append `key=value` pairs, URL encoded, to `base`.
pub(crate) fn with_query(base: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", base, query)
}

/// POST the authorization-code grant and parse the token response.
pub(crate) async fn request_tokens(
    client: &reqwest::Client,
    provider: AuthProvider,
    token_url: &str,
    form: &[(&str, &str)],
) -> Option<OAuthTokens> {
    let response = match client.post(token_url).form(form).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(provider = %provider, error = %e, "Token request failed");
            return None;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(provider = %provider, %status, body = %body, "Token exchange rejected");
        return None;
    }

    match response.json::<OAuthTokens>().await {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            tracing::error!(provider = %provider, error = %e, "Unreadable token response");
            None
        }
    }
}

/// GET a bearer-authenticated JSON document.
pub(crate) async fn fetch_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    provider: AuthProvider,
    url: &str,
    access_token: &str,
) -> Result<T, GatewayError> {
    let response = client
        .get(url)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(provider = %provider, error = %e, "Profile request failed");
            GatewayError::ProviderAuthFailed
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(provider = %provider, %status, body = %body, "Profile request rejected");
        return Err(GatewayError::ProviderAuthFailed);
    }

    response.json::<T>().await.map_err(|e| {
        tracing::error!(provider = %provider, error = %e, "Unreadable profile response");
        GatewayError::ProviderAuthFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query_encodes_values() {
        let url = with_query("https://idp.test/auth", &[("scope", "openid email"), ("state", "a|b")]);
        assert_eq!(url, "https://idp.test/auth?scope=openid%20email&state=a%7Cb");
    }

    #[test]
    fn test_only_configured_providers_are_built() {
        let mut config = GatewayConfig::for_tests();
        config.microsoft.client.client_id.clear();
        let providers = build_providers(&config).unwrap();
        assert!(providers.contains_key(&AuthProvider::Google));
        assert!(!providers.contains_key(&AuthProvider::Microsoft));
    }
}
