use security_engine::{
    config::EngineConfig,
    middleware::Authenticated,
    models::AccessControlRule,
    protect_forward_auth,
    services::{InMemoryCredentialStore, TracingAuditSink},
    SecurityEngine,
};
use service_core::axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on bad configuration
    let config = EngineConfig::from_env()?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.common.service_name,
        environment = ?config.environment,
        "Starting security engine"
    );

    let rules = load_rules()?;
    let port = config.common.port;
    let engine = Arc::new(
        SecurityEngine::connect(
            config,
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(TracingAuditSink),
            rules,
        )
        .await?,
    );

    let shutdown = CancellationToken::new();
    let maintenance = engine.spawn_maintenance(shutdown.clone());

    // Forward-auth: a proxy names the original request in headers, 200 means pass it on.
    let app = Router::new()
        .route("/health", get(health).with_state(engine.clone()))
        .merge(protect_forward_auth(
            Router::new().fallback(forward_auth),
            engine,
        ))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    shutdown.cancel();
    if let Err(e) = maintenance.await {
        tracing::error!(error = %e, "Maintenance task panicked");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

/// Rules come from the JSON file named by `ACCESS_RULES_PATH`. Without one every request is denied.
fn load_rules() -> Result<Vec<AccessControlRule>, AppError> {
    let Ok(path) = std::env::var("ACCESS_RULES_PATH") else {
        tracing::warn!("ACCESS_RULES_PATH not set, all requests will be denied");
        return Ok(Vec::new());
    };

    let raw = std::fs::read_to_string(&path)?;
    let rules: Vec<AccessControlRule> = serde_json::from_str(&raw).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid access rules in {}: {}", path, e))
    })?;
    tracing::info!(path = %path, count = rules.len(), "Access rules loaded");
    Ok(rules)
}

async fn health(
    State(engine): State<Arc<SecurityEngine>>,
) -> Result<Json<serde_json::Value>, AppError> {
    engine.health().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn forward_auth(subject: Option<Authenticated>) -> (StatusCode, Json<serde_json::Value>) {
    let subject = subject.map(|Authenticated(claims)| claims.sub);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "allowed": true, "subject": subject })),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
