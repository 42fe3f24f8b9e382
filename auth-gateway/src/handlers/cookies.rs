use axum::http::{header, HeaderMap};
use axum_extra::extract::cookie::{Cookie, SameSite};
use std::net::SocketAddr;

use crate::config::SessionConfig;
use crate::services::ClientInfo;

pub const OAUTH_STATE_COOKIE: &str = "gateway_oauth_state";
const OAUTH_STATE_MAX_AGE_MINUTES: i64 = 10;

/// Session cookie scoped to the shared parent domain.
pub fn session_cookie(config: &SessionConfig, value: String, max_age_seconds: i64) -> Cookie<'static> {
    let mut builder = Cookie::build((config.cookie_name.clone(), value))
        .path("/")
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age_seconds.max(0)));
    if let Some(domain) = &config.cookie_domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

/// Expired session cookie with the same scope as [`session_cookie`].
pub fn cleared_session_cookie(config: &SessionConfig) -> Cookie<'static> {
    session_cookie(config, String::new(), 0)
}

/// Short-lived cookie carrying the OAuth nonce between redirect and callback.
pub fn oauth_state_cookie(config: &SessionConfig, nonce: String) -> Cookie<'static> {
    Cookie::build((OAUTH_STATE_COOKIE, nonce))
        .path("/auth/oauth")
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::minutes(OAUTH_STATE_MAX_AGE_MINUTES))
        .build()
}

pub fn cleared_oauth_state_cookie(config: &SessionConfig) -> Cookie<'static> {
    Cookie::build((OAUTH_STATE_COOKIE, ""))
        .path("/auth/oauth")
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::ZERO)
        .build()
}

/// Caller address and user agent for session and audit records.
pub fn client_info(addr: SocketAddr, headers: &HeaderMap) -> ClientInfo {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ClientInfo {
        ip_address: Some(ip),
        user_agent,
    }
}
