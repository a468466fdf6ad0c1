//! Channel Manager
//!
//! Single-binary service that:
//! 1. Loads channel definitions and pool settings from TOML
//! 2. Registers every channel, resuming persisted quota and health state
//! 3. Runs the quota rollover and proactive token refresh tasks
//! 4. Serves read-only pool status for dashboards and monitoring

mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use channel_auth::OAuthRefresher;
use channel_pool::{Registry, SystemClock};
use channel_store::JsonChannelStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;

/// How long in-flight requests may drain after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for token endpoint requests
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/channels", get(channels_handler))
        .route("/channels/{id}", get(channel_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting channel-manager");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        channels = config.channels.len(),
        "configuration loaded"
    );

    let store = JsonChannelStore::load(config.store.path.clone())
        .await
        .with_context(|| format!("failed to open store {}", config.store.path.display()))?;

    let client = reqwest::Client::builder()
        .timeout(TOKEN_REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let refresher = OAuthRefresher::new(
        client,
        config.oauth.token_endpoint.clone(),
        config.oauth.client_id.clone(),
        config.oauth.client_secret.take(),
    );

    let registry = Arc::new(
        Registry::new(
            config.pool.clone(),
            Arc::new(store),
            Arc::new(refresher),
            Arc::new(SystemClock),
        )
        .context("invalid pool settings")?,
    );

    let mut registered = 0;
    for section in &config.channels {
        let result = match section.to_channel_config() {
            Ok(channel) => registry.register(channel).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(_) => registered += 1,
            Err(e) => {
                error!(channel_id = %section.id, error = %e, "failed to register channel, skipping");
            }
        }
    }
    info!(
        registered,
        configured = config.channels.len(),
        "channels registered"
    );

    let maintenance = &config.maintenance;
    let reset_task = channel_pool::spawn_quota_reset_task(
        registry.clone(),
        Duration::from_secs(maintenance.quota_reset_interval_secs),
    );
    let refresh_task = channel_pool::spawn_refresh_task(
        registry.clone(),
        Duration::from_secs(maintenance.refresh_interval_secs),
        Duration::from_secs(maintenance.refresh_threshold_secs),
    );

    let app_state = AppState {
        registry,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    reset_task.abort();
    refresh_task.abort();
    let _ = shutdown_tx.send(());

    // The drain timer starts at signal receipt
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health: 200 while at least one channel is eligible, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.registry.health().await;
    let status_code = if health.is_available() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": health.status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channels_total": health.channels_total,
        "channels_eligible": health.channels_eligible,
        "ineligible": health.ineligible,
        "channels": health.channels,
    });

    metrics::record_request("/health", status_code.as_u16());
    (status_code, axum::Json(body)).into_response()
}

async fn channels_handler(State(state): State<AppState>) -> Response {
    match state.registry.status(None).await {
        Ok(channels) => {
            metrics::record_request("/channels", 200);
            (StatusCode::OK, axum::Json(channels)).into_response()
        }
        Err(e) => error_response("/channels", &e),
    }
}

async fn channel_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Ok(channel) => {
            metrics::record_request("/channels/{id}", 200);
            (StatusCode::OK, axum::Json(channel)).into_response()
        }
        Err(e) => error_response("/channels/{id}", &e),
    }
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Map a pool error onto an HTTP status and JSON error body.
fn error_response(route: &str, e: &channel_pool::Error) -> Response {
    let (status, error_type) = match e {
        channel_pool::Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        e if e.is_retry_later() => (StatusCode::SERVICE_UNAVAILABLE, "try_later"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        warn!(route, error = %e, "request failed");
    }
    metrics::record_request(route, status.as_u16());
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": e.to_string(),
        }
    });
    (status, axum::Json(body)).into_response()
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
