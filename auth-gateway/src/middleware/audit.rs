//! Per-request audit trail for impersonated sessions.
//!
//! Gateway routes are audited by [`impersonation_audit_middleware`]; calls to
//! upstream applications are audited from the forward-auth check through
//! [`audit_forwarded_call`]. Rows are written from a spawned task after the
//! response is produced; a failed write is logged and counted, never
//! surfaced to the caller.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use service_core::middleware::rate_limit::client_ip;
use uuid::Uuid;

use super::session::CurrentSession;
use crate::dtos::ErrorResponse;
use crate::models::{AuditAction, ImpersonationAuditLog};
use crate::services::{metrics, ImpersonationService};
use crate::utils::sha256_hex;
use crate::AppState;

pub const MAX_AUDITED_BODY_BYTES: usize = 1024 * 1024;

/// `(resource_type, resource_id)` for a request path.
///
/// Leading `api` and version segments (`v1`, `v2`, ...) are skipped; the
/// first remaining segment is the type and the next one is the id when it
/// looks like a UUID or a number.
pub fn resource_from_path(path: &str) -> (Option<String>, Option<String>) {
    let mut segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip_while(|s| s.eq_ignore_ascii_case("api") || is_version(s));

    let resource_type = segments.next().map(str::to_string);
    let resource_id = segments
        .next()
        .filter(|s| is_identifier(s))
        .map(str::to_string);
    (resource_type, resource_id)
}

fn is_version(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some('v') | Some('V'))
        && segment.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

fn is_identifier(segment: &str) -> bool {
    Uuid::parse_str(segment).is_ok()
        || (!segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()))
}

pub async fn impersonation_audit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let impersonation_id = match req.extensions().get::<CurrentSession>() {
        Some(current) if current.session.is_impersonated => current.session.impersonation_id,
        _ => None,
    };
    let Some(impersonation_id) = impersonation_id else {
        return next.run(req).await;
    };

    match state.impersonation.active_impersonation(impersonation_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return next.run(req).await,
        Err(e) => {
            tracing::warn!(error = %e, "Could not check impersonation for audit");
            metrics::record_audit_failure();
            return next.run(req).await;
        }
    }

    let method = req.method().to_string();
    let endpoint = req.uri().path().to_string();
    let ip_address = client_ip(&req).map(|ip| ip.to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (parts, body) = req.into_parts();
    let (response, request_body_hash) = match to_bytes(body, MAX_AUDITED_BODY_BYTES).await {
        Ok(bytes) => {
            let hash = (!bytes.is_empty()).then(|| sha256_hex(&bytes));
            let req = Request::from_parts(parts, Body::from(bytes));
            (next.run(req).await, hash)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Impersonated request body rejected");
            let response = (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse {
                    error: "Request body too large".to_string(),
                }),
            )
                .into_response();
            (response, None)
        }
    };

    let status = response.status().as_u16();
    let (resource_type, resource_id) = resource_from_path(&endpoint);
    let entry = ImpersonationAuditLog {
        audit_id: Uuid::new_v4(),
        impersonation_id,
        action: AuditAction::from_status(status).as_str().to_string(),
        resource_type,
        resource_id,
        http_method: method,
        endpoint,
        request_body_hash,
        response_status_code: Some(i32::from(status)),
        ip_address,
        user_agent,
        created_utc: Utc::now(),
    };

    let impersonation = state.impersonation.clone();
    tokio::spawn(async move { write_entry(&impersonation, entry).await });

    response
}

/// An upstream request as described by the reverse proxy.
#[derive(Debug, Clone)]
pub struct ForwardedCall {
    pub method: String,
    /// Path and query of the original request.
    pub uri: String,
    pub status: u16,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Record a proxied call made on an impersonated session. The activity
/// check and the insert both run in the spawned task.
pub fn audit_forwarded_call(
    impersonation: ImpersonationService,
    impersonation_id: Uuid,
    call: ForwardedCall,
) {
    tokio::spawn(async move {
        match impersonation.active_impersonation(impersonation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(%impersonation_id, error = %e, "Could not check impersonation for audit");
                metrics::record_audit_failure();
                return;
            }
        }

        let endpoint = call
            .uri
            .split(['?', '#'])
            .next()
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();
        let (resource_type, resource_id) = resource_from_path(&endpoint);
        let entry = ImpersonationAuditLog {
            audit_id: Uuid::new_v4(),
            impersonation_id,
            action: AuditAction::from_status(call.status).as_str().to_string(),
            resource_type,
            resource_id,
            http_method: call.method,
            endpoint,
            request_body_hash: None,
            response_status_code: Some(i32::from(call.status)),
            ip_address: call.ip_address,
            user_agent: call.user_agent,
            created_utc: Utc::now(),
        };
        write_entry(&impersonation, entry).await;
    });
}

async fn write_entry(impersonation: &ImpersonationService, entry: ImpersonationAuditLog) {
    if let Err(e) = impersonation.record_audit(&entry).await {
        tracing::warn!(
            impersonation_id = %entry.impersonation_id,
            error = %e,
            "Failed to write impersonation audit row"
        );
        metrics::record_audit_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_from_path() {
        let id = "8a6e0804-2bd0-4672-b79d-d97027f9071a";
        assert_eq!(
            resource_from_path(&format!("/api/v1/orders/{}/lines", id)),
            (Some("orders".into()), Some(id.into()))
        );
        assert_eq!(
            resource_from_path("/v2/invoices/1042"),
            (Some("invoices".into()), Some("1042".into()))
        );
        assert_eq!(
            resource_from_path("/auth/me"),
            (Some("auth".into()), None)
        );
        assert_eq!(resource_from_path("/"), (None, None));
        assert_eq!(resource_from_path("/api/v1"), (None, None));
    }

    #[test]
    fn test_version_segments() {
        assert!(is_version("v1"));
        assert!(is_version("V12"));
        assert!(!is_version("v"));
        assert!(!is_version("vault"));
    }
}
