use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use service_core::{error::AppError, middleware::rate_limit::client_ip};

use crate::{
    middleware::{
        audit::{audit_forwarded_call, ForwardedCall},
        session::session_key_from_headers,
    },
    services::{Decision, DenyReason},
    AppState,
};

const FORWARDED_HOST: &str = "x-forwarded-host";
const FORWARDED_METHOD: &str = "x-forwarded-method";
const FORWARDED_URI: &str = "x-forwarded-uri";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Forward-auth check for the reverse proxy
///
/// The proxy passes the original request's cookies and `X-Forwarded-Host`,
/// `X-Forwarded-Method` and `X-Forwarded-Uri`. 200 carries the identity
/// headers to copy upstream. Calls made on an impersonated session are
/// added to that impersonation's audit trail.
#[utoipa::path(
    get,
    path = "/auth/verify",
    responses(
        (status = 200, description = "Allowed; identity in X-Auth-* headers"),
        (status = 401, description = "No live session"),
        (status = 403, description = "No access to the target application")
    ),
    tag = "Forward Auth"
)]
pub async fn verify(State(state): State<AppState>, req: Request) -> Result<Response, AppError> {
    let headers = req.headers();
    let session_key = session_key_from_headers(headers, &state.config.session.cookie_name);
    let host = header_str(headers, FORWARDED_HOST);

    let verdict = state.forward_auth.decide(session_key.as_deref(), host).await?;

    let response = match verdict.decision {
        Decision::Allow(identity) => {
            let mut out = HeaderMap::new();
            let mut representable = true;
            for (name, value) in identity.pairs() {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                    (Ok(name), Ok(value)) => {
                        out.insert(name, value);
                    }
                    _ => {
                        tracing::warn!(header = name, "Identity header is not representable");
                        representable = false;
                        break;
                    }
                }
            }
            if representable {
                (StatusCode::OK, out).into_response()
            } else {
                StatusCode::FORBIDDEN.into_response()
            }
        }
        Decision::Deny(DenyReason::Unauthenticated) => StatusCode::UNAUTHORIZED.into_response(),
        Decision::Deny(DenyReason::Forbidden) => StatusCode::FORBIDDEN.into_response(),
    };

    if let Some(impersonation_id) = verdict.impersonation_id {
        let call = ForwardedCall {
            method: header_str(headers, FORWARDED_METHOD)
                .unwrap_or_else(|| req.method().as_str())
                .to_ascii_uppercase(),
            uri: header_str(headers, FORWARDED_URI).unwrap_or("/").to_string(),
            status: response.status().as_u16(),
            ip_address: client_ip(&req).map(|ip| ip.to_string()),
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_string),
        };
        audit_forwarded_call(state.impersonation.clone(), impersonation_id, call);
    }

    Ok(response)
}
