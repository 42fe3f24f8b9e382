use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::HeaderMap,
    response::Redirect,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::{net::SocketAddr, sync::Arc};

use super::cookies::{
    cleared_oauth_state_cookie, client_info, oauth_state_cookie, session_cookie, OAUTH_STATE_COOKIE,
};
use crate::{
    dtos::auth::{OAuthCallbackQuery, OAuthLoginQuery},
    models::AuthProvider,
    services::{
        oauth::{state as oauth_state, AuthorizationParams},
        GatewayError, OAuthProvider,
    },
    utils::constant_time_eq,
    AppState,
};

const GENERIC_ERROR: &str = "oauth_failed";

fn provider_for(state: &AppState, name: &str) -> Result<Arc<dyn OAuthProvider>, AppError> {
    name.parse::<AuthProvider>()
        .ok()
        .filter(|p| *p != AuthProvider::Local)
        .and_then(|p| state.oauth.get(&p).cloned())
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown sign-in provider")))
}

fn frontend_redirect(state: &AppState, error: Option<&str>) -> Redirect {
    let base = state.config.security.frontend_url.trim_end_matches('/');
    match error {
        Some(code) => Redirect::to(&format!("{}/login?error={}", base, urlencoding::encode(code))),
        None => Redirect::to(&format!("{}/", base)),
    }
}

/// Start the provider sign-in flow
#[utoipa::path(
    get,
    path = "/auth/oauth/{provider}/login",
    params(
        ("provider" = String, Path, description = "google or microsoft"),
        OAuthLoginQuery
    ),
    responses(
        (status = 303, description = "Redirect to the provider"),
        (status = 404, description = "Provider not configured", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn oauth_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthLoginQuery>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AppError> {
    let provider = provider_for(&state, &provider)?;
    let nonce = oauth_state::generate_nonce();

    let params = AuthorizationParams {
        nonce: &nonce,
        invitation_token: query.invitation.as_deref(),
        force_login: query.force,
        is_registration: query.register,
        email_hint: query.email_hint.as_deref(),
    };
    let url = provider.build_authorization_url(&params);

    let jar = jar.add(oauth_state_cookie(&state.config.session, nonce));
    Ok((jar, Redirect::to(&url)))
}

/// Provider redirect target
///
/// Always answers with a redirect to the frontend; failures carry an
/// `error` code and never the provider's own message.
#[utoipa::path(
    get,
    path = "/auth/oauth/{provider}/callback",
    params(
        ("provider" = String, Path, description = "google or microsoft"),
        OAuthCallbackQuery
    ),
    responses(
        (status = 303, description = "Redirect to the frontend"),
        (status = 404, description = "Provider not configured", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Query(query): Query<OAuthCallbackQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AppError> {
    let provider = provider_for(&state, &provider_name)?;
    let expected_nonce = jar.get(OAUTH_STATE_COOKIE).map(|c| c.value().to_string());
    let jar = jar.add(cleared_oauth_state_cookie(&state.config.session));

    if let Some(error) = &query.error {
        tracing::warn!(provider = %provider_name, error = %error, "Provider returned an error");
        return Ok((jar, frontend_redirect(&state, Some(GENERIC_ERROR))));
    }

    let decoded = query.state.as_deref().and_then(oauth_state::decode);
    let state_ok = match (&decoded, &expected_nonce) {
        (Some(decoded), Some(expected)) => constant_time_eq(&decoded.nonce, expected),
        _ => false,
    };
    let (Some(decoded), true) = (decoded, state_ok) else {
        tracing::warn!(provider = %provider_name, "OAuth state mismatch");
        return Ok((jar, frontend_redirect(&state, Some(GENERIC_ERROR))));
    };

    let Some(code) = query.code.as_deref().filter(|c| !c.is_empty()) else {
        return Ok((jar, frontend_redirect(&state, Some(GENERIC_ERROR))));
    };

    let Some(tokens) = provider.exchange_code(code).await else {
        return Ok((jar, frontend_redirect(&state, Some(GENERIC_ERROR))));
    };

    let client = client_info(addr, &headers);
    let resolved = match provider.fetch_profile(&tokens.access_token).await {
        Ok(profile) => {
            state
                .identity
                .resolve_external(
                    provider.kind(),
                    &profile,
                    decoded.invitation_token.as_deref(),
                    &client,
                )
                .await
        }
        Err(e) => Err(e),
    };

    match resolved {
        Ok((user, session_key)) => {
            tracing::info!(user_id = %user.user_id, provider = %provider_name, "OAuth sign-in completed");
            let cookie = session_cookie(
                &state.config.session,
                session_key,
                state.sessions.lifetime().num_seconds(),
            );
            Ok((jar.add(cookie), frontend_redirect(&state, None)))
        }
        Err(e) => {
            let code = match &e {
                GatewayError::InvalidInvitation => "invalid_invitation",
                GatewayError::ProviderMismatch => "provider_mismatch",
                GatewayError::InvalidCredentials => "account_disabled",
                _ => GENERIC_ERROR,
            };
            tracing::warn!(provider = %provider_name, error = %e, "OAuth sign-in failed");
            Ok((jar, frontend_redirect(&state, Some(code))))
        }
    }
}
