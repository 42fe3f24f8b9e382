//! Super-admin endpoints. Routed behind `require_super_admin`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        admin::{CreateInvitationRequest, DeleteUserResponse, InvitationResponse},
        auth::MessageResponse,
        impersonation::ImpersonationSummary,
    },
    middleware::SessionUser,
    models::ImpersonationAuditLog,
    services::UserRepository,
    utils::ValidatedJson,
    AppState,
};

const DEFAULT_INVITATION_HOURS: i64 = 168;

/// List active impersonation sessions
#[utoipa::path(
    get,
    path = "/auth/admin/impersonations",
    responses(
        (status = 200, description = "Active impersonations", body = [ImpersonationSummary]),
        (status = 403, description = "Super admin required", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("session_cookie" = []))
)]
pub async fn list_impersonations(
    State(state): State<AppState>,
) -> Result<Json<Vec<ImpersonationSummary>>, AppError> {
    let rows = state.impersonation.list_active().await?;
    Ok(Json(rows.into_iter().map(ImpersonationSummary::from).collect()))
}

/// Force-end an impersonation session
#[utoipa::path(
    post,
    path = "/auth/admin/impersonations/{id}/end",
    params(("id" = Uuid, Path, description = "Impersonation id")),
    responses(
        (status = 200, description = "Impersonation revoked", body = MessageResponse),
        (status = 404, description = "No active impersonation with that id", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("session_cookie" = []))
)]
pub async fn force_end_impersonation(
    State(state): State<AppState>,
    SessionUser(admin): SessionUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .impersonation
        .force_end(id, admin.session.user_id)
        .await?;
    Ok(Json(MessageResponse {
        message: "Impersonation revoked".to_string(),
    }))
}

/// Audit trail of one impersonation session
#[utoipa::path(
    get,
    path = "/auth/admin/impersonations/{id}/audit",
    params(("id" = Uuid, Path, description = "Impersonation id")),
    responses(
        (status = 200, description = "Audited requests, oldest first", body = [ImpersonationAuditLog])
    ),
    tag = "Admin",
    security(("session_cookie" = []))
)]
pub async fn impersonation_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ImpersonationAuditLog>>, AppError> {
    Ok(Json(state.impersonation.audit_trail(id).await?))
}

/// Create a registration invitation
#[utoipa::path(
    post,
    path = "/auth/admin/invitations",
    request_body = CreateInvitationRequest,
    responses(
        (status = 201, description = "Invitation created", body = InvitationResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("session_cookie" = []))
)]
pub async fn create_invitation(
    State(state): State<AppState>,
    SessionUser(admin): SessionUser,
    ValidatedJson(req): ValidatedJson<CreateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let hours = req.valid_for_hours.unwrap_or(DEFAULT_INVITATION_HOURS);
    let invitation = state
        .identity
        .create_invitation(
            &req.email,
            req.provider,
            req.role_ids,
            chrono::Duration::hours(hours),
            admin.session.user_id,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(InvitationResponse::from(invitation))))
}

/// Delete a user, revoking their impersonations and sessions
#[utoipa::path(
    delete,
    path = "/auth/admin/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User deleted", body = DeleteUserResponse),
        (status = 400, description = "Cannot delete yourself", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("session_cookie" = []))
)]
pub async fn delete_user(
    State(state): State<AppState>,
    SessionUser(admin): SessionUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteUserResponse>, AppError> {
    if id == admin.session.user_id {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "You cannot delete your own account"
        )));
    }
    if state.store.find_user_by_id(id).await?.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!("User not found")));
    }

    let impersonations_revoked = state
        .impersonation
        .revoke_for_user(id, admin.session.user_id)
        .await?;
    state.store.delete_user(id).await?;
    let sessions_removed = state.sessions.delete_sessions_for_user(id).await?;

    tracing::info!(user_id = %id, admin_id = %admin.session.user_id, sessions_removed, "User deleted");
    Ok(Json(DeleteUserResponse {
        id,
        sessions_removed,
        impersonations_revoked,
    }))
}
