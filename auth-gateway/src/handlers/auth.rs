use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::net::SocketAddr;

use super::cookies::{cleared_session_cookie, client_info, session_cookie};
use crate::{
    dtos::auth::{LoginRequest, MeResponse, MessageResponse, OtpRequiredResponse, RegisterRequest},
    middleware::{OptionalSession, SessionUser},
    models::{AuthProvider, EndReason, UserProfile},
    services::LoginOutcome,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Log in with username and password
///
/// With OTP enabled the first call sends a code and answers `requiresOtp`;
/// the second call carries `otpCode` and sets the session cookie.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in, or a verification code was sent", body = UserProfile),
        (status = 401, description = "Invalid credentials or code", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let client = client_info(addr, &headers);
    let password = Password::new(req.password);

    let outcome = state
        .credentials
        .login(&req.username, &password, req.otp_code.as_deref(), &client)
        .await?;

    match outcome {
        LoginOutcome::OtpRequired { email } => Ok((
            StatusCode::OK,
            Json(OtpRequiredResponse {
                requires_otp: true,
                email,
                message: "A verification code has been sent to your email".to_string(),
            }),
        )
            .into_response()),
        LoginOutcome::Authenticated { user, session_key } => {
            let cookie = session_cookie(
                &state.config.session,
                session_key,
                state.sessions.lifetime().num_seconds(),
            );
            Ok((jar.add(cookie), Json(UserProfile::from(user))).into_response())
        }
    }
}

/// Log out and clear the session cookie
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse)
    ),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<AppState>,
    OptionalSession(current): OptionalSession,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    if let Some(current) = current {
        if current.session.is_impersonated {
            state
                .impersonation
                .end(&current.key, EndReason::Manual)
                .await?;
        } else {
            state.sessions.invalidate_session(&current.key).await?;
        }
        tracing::info!(user_id = %current.session.user_id, "User logged out");
    }

    Ok((
        jar.add(cleared_session_cookie(&state.config.session)),
        Json(MessageResponse {
            message: "Logged out".to_string(),
        }),
    ))
}

/// Current session identity
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Current session", body = MeResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("session_cookie" = []))
)]
pub async fn me(SessionUser(current): SessionUser) -> Json<MeResponse> {
    Json(MeResponse::from(current.session))
}

/// Register a local account from an invitation
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and logged in", body = UserProfile),
        (status = 400, description = "Invalid invitation, or username or email taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.provider != AuthProvider::Local {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Use the provider sign-in flow to register a {} account",
            req.provider
        )));
    }

    let client = client_info(addr, &headers);
    let password = Password::new(req.password);
    let (user, session_key) = state
        .identity
        .register_local(&req.token, &req.username, &password, &client)
        .await?;

    let cookie = session_cookie(
        &state.config.session,
        session_key,
        state.sessions.lifetime().num_seconds(),
    );
    Ok((StatusCode::CREATED, jar.add(cookie), Json(UserProfile::from(user))))
}
