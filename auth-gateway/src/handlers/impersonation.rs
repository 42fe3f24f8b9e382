use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use service_core::error::AppError;
use std::net::SocketAddr;

use super::cookies::{cleared_session_cookie, client_info, session_cookie};
use crate::{
    dtos::impersonation::{
        EndImpersonationResponse, ImpersonationStatusResponse, StartImpersonationRequest,
        StartImpersonationResponse,
    },
    middleware::SessionUser,
    models::{EndReason, UserProfile},
    services::StartRequest,
    utils::ValidatedJson,
    AppState,
};

/// Start impersonating another user
///
/// The caller's cookie is replaced by the impersonated session; the original
/// session stays alive and is restored by `/auth/impersonation/end`.
#[utoipa::path(
    post,
    path = "/auth/impersonation/start",
    request_body = StartImpersonationRequest,
    responses(
        (status = 200, description = "Impersonation started", body = StartImpersonationResponse),
        (status = 400, description = "Impersonation refused", body = ErrorResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse)
    ),
    tag = "Impersonation",
    security(("session_cookie" = []))
)]
pub async fn start_impersonation(
    State(state): State<AppState>,
    SessionUser(current): SessionUser,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<StartImpersonationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let started = state
        .impersonation
        .start(StartRequest {
            impersonator_id: current.session.user_id,
            impersonator_session_key: current.key,
            target_user_id: req.target_user_id,
            reason: req.reason,
            duration_minutes: req.duration_minutes,
            client: client_info(addr, &headers),
        })
        .await?;

    let remaining = (started.expires_at - Utc::now()).num_seconds();
    let cookie = session_cookie(&state.config.session, started.session_key, remaining);

    Ok((
        StatusCode::OK,
        jar.add(cookie),
        Json(StartImpersonationResponse {
            impersonation_id: started.impersonation_id,
            target: UserProfile::from(started.target),
            expires_at: started.expires_at,
        }),
    ))
}

/// Stop impersonating and return to the original session
#[utoipa::path(
    post,
    path = "/auth/impersonation/end",
    responses(
        (status = 200, description = "Impersonation ended", body = EndImpersonationResponse),
        (status = 400, description = "Session is not an impersonation", body = ErrorResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse)
    ),
    tag = "Impersonation",
    security(("session_cookie" = []))
)]
pub async fn end_impersonation(
    State(state): State<AppState>,
    SessionUser(current): SessionUser,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    let ended = state
        .impersonation
        .end(&current.key, EndReason::Manual)
        .await?;

    let original = match &ended.original_session_key {
        Some(key) => state
            .sessions
            .get_session(key)
            .await?
            .map(|session| (key.clone(), session)),
        None => None,
    };

    let (jar, restored) = match original {
        Some((key, session)) => {
            let remaining = session.remaining_seconds(Utc::now());
            (jar.add(session_cookie(&state.config.session, key, remaining)), true)
        }
        None => (jar.add(cleared_session_cookie(&state.config.session)), false),
    };

    let message = if restored {
        "Impersonation ended; your session was restored"
    } else {
        "Impersonation ended; please log in again"
    };
    Ok((
        jar,
        Json(EndImpersonationResponse {
            impersonation_id: ended.impersonation_id,
            restored,
            message: message.to_string(),
        }),
    ))
}

/// Impersonation state of the current session
#[utoipa::path(
    get,
    path = "/auth/impersonation/status",
    responses(
        (status = 200, description = "Current impersonation state", body = ImpersonationStatusResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse)
    ),
    tag = "Impersonation",
    security(("session_cookie" = []))
)]
pub async fn impersonation_status(
    State(state): State<AppState>,
    SessionUser(current): SessionUser,
) -> Result<Json<ImpersonationStatusResponse>, AppError> {
    let status = state.impersonation.status(&current.key).await?;
    Ok(Json(status.into()))
}
