use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use echelon_engine::RunController;

use crate::handlers;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8710,
            request_timeout_secs: 300,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RunController>,
}

/// Build the Axum router with all routes. The event stream must
/// outlive the request timeout, so only the plain routes carry the
/// timeout layer.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/hierarchies",
            post(handlers::create_hierarchy).get(handlers::list_hierarchies),
        )
        .route("/hierarchies/{id}", get(handlers::get_hierarchy))
        .route("/runs", post(handlers::start_run).get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .layer(TimeoutLayer::new(request_timeout));

    api.route("/runs/{id}/events", get(handlers::stream_events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle carrying the bound
/// port and the serving task.
pub async fn start(
    config: ServerConfig,
    controller: Arc<RunController>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState { controller };
    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the server;
/// the serving task runs until the process exits.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
