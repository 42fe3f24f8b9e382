pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    request_id::{request_id_middleware, REQUEST_ID_HEADER},
    security_headers::security_headers_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{GatewayConfig, SwaggerMode};
use crate::services::{
    CredentialService, ForwardAuthService, GatewayStore, IdentityService, ImpersonationService,
    Notifier, ProviderMap, SessionStore,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::forward_auth::verify,
        handlers::auth::login,
        handlers::auth::logout,
        handlers::auth::me,
        handlers::auth::register,
        handlers::oauth::oauth_login,
        handlers::oauth::oauth_callback,
        handlers::impersonation::start_impersonation,
        handlers::impersonation::end_impersonation,
        handlers::impersonation::impersonation_status,
        handlers::admin::list_impersonations,
        handlers::admin::force_end_impersonation,
        handlers::admin::impersonation_audit,
        handlers::admin::create_invitation,
        handlers::admin::delete_user,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::LoginRequest,
            dtos::auth::OtpRequiredResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::MeResponse,
            dtos::auth::ImpersonatorInfo,
            dtos::auth::MessageResponse,
            dtos::impersonation::StartImpersonationRequest,
            dtos::impersonation::StartImpersonationResponse,
            dtos::impersonation::EndImpersonationResponse,
            dtos::impersonation::ImpersonationStatusResponse,
            dtos::impersonation::ImpersonationSummary,
            dtos::admin::CreateInvitationRequest,
            dtos::admin::InvitationResponse,
            dtos::admin::DeleteUserResponse,
            models::UserProfile,
            models::AuthProvider,
            models::InvitationProvider,
            models::ImpersonationAuditLog,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Local login, registration and sessions"),
        (name = "OAuth", description = "Google and Microsoft sign-in"),
        (name = "Forward Auth", description = "Reverse-proxy access decisions"),
        (name = "Impersonation", description = "Audited support impersonation"),
        (name = "Admin", description = "Super-admin operations"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "session_cookie",
                SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::new("gateway_session"))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn GatewayStore>,
    pub sessions: SessionStore,
    pub credentials: CredentialService,
    pub identity: IdentityService,
    pub forward_auth: ForwardAuthService,
    pub impersonation: ImpersonationService,
    pub oauth: Arc<ProviderMap>,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire the domain services over one store, one session backend and
    /// one notifier.
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn GatewayStore>,
        sessions: SessionStore,
        notifier: Arc<dyn Notifier>,
        oauth: ProviderMap,
    ) -> Self {
        let credentials = CredentialService::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            config.otp.clone(),
        );
        let identity = IdentityService::new(store.clone(), sessions.clone());
        let forward_auth = ForwardAuthService::new(store.clone(), sessions.clone());
        let impersonation = ImpersonationService::new(
            store.clone(),
            sessions.clone(),
            notifier,
            config.impersonation.clone(),
        );

        let limits = &config.rate_limit;
        let login_rate_limiter =
            create_ip_rate_limiter(limits.login_attempts, limits.login_window_seconds);
        let register_rate_limiter =
            create_ip_rate_limiter(limits.register_attempts, limits.register_window_seconds);
        let ip_rate_limiter =
            create_ip_rate_limiter(limits.global_ip_limit, limits.global_ip_window_seconds);

        Self {
            config: Arc::new(config),
            store,
            sessions,
            credentials,
            identity,
            forward_auth,
            impersonation,
            oauth: Arc::new(oauth),
            login_rate_limiter,
            register_rate_limiter,
            ip_rate_limiter,
        }
    }
}

/// Liveness of the database and the session backend
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "All dependencies reachable"),
        (status = 503, description = "A dependency is down")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await;
    let sessions = state.sessions.health_check().await;

    if let Err(e) = &database {
        tracing::error!(error = %e, "Database health check failed");
    }
    if let Err(e) = &sessions {
        tracing::error!(error = %e, "Session backend health check failed");
    }

    let status = if database.is_ok() && sessions.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let label = |ok: bool| if ok { "up" } else { "down" };

    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "ok" } else { "degraded" },
            "service": state.config.service_name,
            "version": state.config.service_version,
            "database": label(database.is_ok()),
            "sessionStore": label(sessions.is_ok()),
        })),
    )
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let login_route = Router::new()
        .route("/auth/login", post(handlers::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let register_route = Router::new()
        .route("/auth/register", post(handlers::register))
        .layer(from_fn_with_state(
            state.register_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let admin_routes = Router::new()
        .route("/auth/admin/impersonations", get(handlers::list_impersonations))
        .route(
            "/auth/admin/impersonations/:id/end",
            post(handlers::force_end_impersonation),
        )
        .route(
            "/auth/admin/impersonations/:id/audit",
            get(handlers::impersonation_audit),
        )
        .route("/auth/admin/invitations", post(handlers::create_invitation))
        .route("/auth/admin/users/:id", delete(handlers::delete_user))
        .route_layer(from_fn(middleware::require_super_admin));

    // Everything a browser session can reach. The audit layer must see the
    // session the outer layer resolved.
    let session_routes = Router::new()
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/me", get(handlers::me))
        .route("/auth/oauth/:provider/login", get(handlers::oauth_login))
        .route("/auth/oauth/:provider/callback", get(handlers::oauth_callback))
        .route(
            "/auth/impersonation/start",
            post(handlers::start_impersonation),
        )
        .route("/auth/impersonation/end", post(handlers::end_impersonation))
        .route(
            "/auth/impersonation/status",
            get(handlers::impersonation_status),
        )
        .merge(login_route)
        .merge(register_route)
        .merge(admin_routes)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::impersonation_audit_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::session_middleware));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        // Audits the proxied call it describes, not the check itself.
        .route("/auth/verify", get(handlers::verify))
        .merge(session_routes);

    if state.config.swagger.enabled == SwaggerMode::Public {
        app = app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    let origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter(|o| {
            // Credentialed CORS cannot use a wildcard.
            let wildcard = o.as_str() == "*";
            if wildcard {
                tracing::warn!("Ignoring wildcard CORS origin");
            }
            !wildcard
        })
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    let app = app
        .route_layer(from_fn(middleware::metrics_middleware))
        .with_state(state.clone())
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_credentials(true)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    HeaderName::from_static(REQUEST_ID_HEADER),
                ]),
        );

    Ok(app)
}
