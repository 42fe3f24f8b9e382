use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use crate::models::Session;
use crate::AppState;

/// The live session behind the request cookie.
#[derive(Debug, Clone)]
pub struct CurrentSession {
    pub key: String,
    pub session: Session,
}

/// Session key from the configured cookie, if any.
pub fn session_key_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(cookie_name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolve the session cookie and attach [`CurrentSession`] when it is live.
/// Requests without one pass through untouched.
pub async fn session_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(key) = session_key_from_headers(req.headers(), &state.config.session.cookie_name) {
        match state.sessions.get_session(&key).await {
            Ok(Some(session)) => {
                req.extensions_mut().insert(CurrentSession { key, session });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to load session");
                return AppError::from(e).into_response();
            }
        }
    }
    next.run(req).await
}

/// Only super-admins acting as themselves get through.
pub async fn require_super_admin(req: Request, next: Next) -> Response {
    match req.extensions().get::<CurrentSession>() {
        None => AppError::Unauthorized(anyhow::anyhow!("Authentication required")).into_response(),
        Some(current) if current.session.is_super_admin && !current.session.is_impersonated => {
            next.run(req).await
        }
        Some(current) => {
            tracing::warn!(user_id = %current.session.user_id, "Admin route refused");
            AppError::Forbidden(anyhow::anyhow!("Super admin access required")).into_response()
        }
    }
}

/// Extractor for handlers that need a logged-in caller.
pub struct SessionUser(pub CurrentSession);

#[axum::async_trait]
impl<S> FromRequestParts<S> for SessionUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .map(SessionUser)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))
    }
}

/// Extractor for handlers that behave differently when logged in.
pub struct OptionalSession(pub Option<CurrentSession>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for OptionalSession
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalSession(parts.extensions.get::<CurrentSession>().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn test_reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "other=1; gateway_session=abc123".parse().unwrap());
        assert_eq!(
            session_key_from_headers(&headers, "gateway_session").as_deref(),
            Some("abc123")
        );
        assert_eq!(session_key_from_headers(&headers, "missing"), None);
    }

    #[test]
    fn test_empty_cookie_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "gateway_session=".parse().unwrap());
        assert_eq!(session_key_from_headers(&headers, "gateway_session"), None);
    }
}
