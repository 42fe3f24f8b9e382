use auth_gateway::{
    build_router,
    config::GatewayConfig,
    db,
    services::{
        impersonation::spawn_cleanup_task, metrics, oauth, Database, EmailProvider,
        NotificationQueue, RedisSessionBackend, SessionStore, SmtpEmailProvider,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;

const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;
const NOTIFICATION_MAX_RETRY: Duration = Duration::from_secs(300);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Local development only; deployments set the environment directly.
    dotenvy::dotenv().ok();

    // Fail fast on bad configuration
    let config = GatewayConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    metrics::init_metrics().map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting auth gateway"
    );

    let pool = db::connect(&config.database).await?;
    let store = Arc::new(Database::new(pool));
    tracing::info!("Database initialized");

    let backend = RedisSessionBackend::new(&config.redis)
        .await
        .map_err(AppError::InternalError)?;
    let sessions = SessionStore::new(Arc::new(backend), config.session.lifetime_seconds);
    tracing::info!("Session store initialized");

    let shutdown = CancellationToken::new();

    let email: Arc<dyn EmailProvider> = Arc::new(
        SmtpEmailProvider::new(&config.smtp).map_err(AppError::ConfigError)?,
    );
    let (queue, receiver) = NotificationQueue::new(NOTIFICATION_QUEUE_CAPACITY);
    let notification_worker =
        NotificationQueue::spawn_worker(receiver, email, NOTIFICATION_MAX_RETRY, shutdown.clone());

    let providers = oauth::build_providers(&config)?;
    tracing::info!(providers = providers.len(), "OAuth providers configured");

    let cleanup_interval = Duration::from_secs(config.impersonation.cleanup_interval_seconds);
    let port = config.common.port;
    let state = AppState::new(config, store, sessions, Arc::new(queue), providers);

    let cleanup_task = spawn_cleanup_task(
        state.impersonation.clone(),
        cleanup_interval,
        shutdown.clone(),
    );

    let app = build_router(state.clone()).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    shutdown.cancel();
    for (name, task) in [("notification worker", notification_worker), ("cleanup task", cleanup_task)] {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            tracing::warn!(task = name, "Background task did not stop in time");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
