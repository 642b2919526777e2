//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::AppError;
use crate::server::handlers::{
    events_handler, health_handler, latest_event_handler, operation_handler,
    start_operation_handler, version_handler,
};
use crate::server::state::ServerState;
use crate::storage::settings::ServerSettings;

/// Routes of the local API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Operations
        .route("/api/apps/{app_id}/{action}", post(start_operation_handler))
        .route("/api/operations/{operation_id}", get(operation_handler))
        .route("/api/operations/{operation_id}/latest", get(latest_event_handler))
        .route("/api/operations/{operation_id}/events", get(events_handler))
        // State and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerSettings,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), AppError>>, AppError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| AppError::ServerError(e.to_string()))
    });

    Ok(handle)
}
