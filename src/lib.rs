pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod hotreload;
pub mod loadbalancer;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod resilience;
pub mod router;
pub mod store;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::GatewayState;
use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the gateway's HTTP surface over an existing state.
///
/// `/route/{serviceId}/...` is the proxying front door; anything else
/// falls back to header-based service addressing.
pub fn build_app(state: GatewayState, metrics_service: metrics::MetricsService) -> Router {
    Router::new()
        .route("/health-status", get(health_status_handler))
        .route("/api/metrics", get(api_metrics_handler))
        .route(
            "/metrics",
            get(move || {
                let service = metrics_service.clone();
                async move { prometheus_handler(service) }
            }),
        )
        .route("/route/:service_id", any(proxy::route_root_handler))
        .route("/route/:service_id/*downstream", any(proxy::route_handler))
        .fallback(proxy::header_route_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let config = state.store.snapshot().await;
    Json(healthcheck::health_report(&config, &state.registry))
}

async fn api_metrics_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let config = state.store.snapshot().await;
    let open = state.breakers.open_count().await;
    let snapshot = state.aggregator.snapshot(
        config.services.len(),
        open,
        state.cache.approximate_size_bytes(),
    );
    Json(snapshot)
}

fn prometheus_handler(service: metrics::MetricsService) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(service.render()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Initialize and run the gateway until shutdown
pub async fn init_gateway(config: GatewayConfig, config_path: Option<PathBuf>) -> Result<()> {
    config.validate()?;

    info!("Starting API gateway");
    info!(
        services = config.services.len(),
        host = %config.server.host,
        port = config.server.port,
        "Configuration loaded"
    );

    let metrics_service = metrics::MetricsService::new()?;
    let hot_reload = config.hot_reload.clone();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = GatewayState::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let checker = healthcheck::HealthChecker::new(state.store.clone(), state.registry.clone())?;
    tokio::spawn(checker.run(shutdown_rx.clone()));

    if hot_reload.enabled {
        match config_path {
            Some(path) => {
                hotreload::HotReloadService::new(path, state.store.clone(), hot_reload.debounce_ms)
                    .start()?;
            }
            None => info!("Hot reload enabled but no config file path known, skipping"),
        }
    }

    let app = build_app(state, metrics_service);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!("Gateway ready to accept connections");

    let mut shutdown_rx_serve = shutdown_rx.clone();
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
            _ = shutdown_rx_serve.changed() => {}
        }
    });

    serve
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    // Stop the health checker loop.
    let _ = shutdown_tx.send(true);

    Ok(())
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portico=debug,tower_http=debug".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
