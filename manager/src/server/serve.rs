//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ManagerError;
use crate::server::handlers::{
    health_handler, notifications_handler, remove_runner_handler, runner_handler,
    runners_handler, scheduler_handler, start_runner_handler, stop_runner_handler,
    version_handler,
};
use crate::server::state::ServerState;

/// Build the router without binding it
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Runners
        .route("/runners", get(runners_handler))
        .route("/runners/{id}", get(runner_handler))
        .route("/runners/{id}/start", post(start_runner_handler))
        .route("/runners/{id}/stop", post(stop_runner_handler))
        .route("/runners/{id}/remove", post(remove_runner_handler))
        // Scheduler and notifications
        .route("/scheduler", get(scheduler_handler))
        .route("/notifications", get(notifications_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ManagerError>>, ManagerError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ManagerError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ManagerError::ServerError(e.to_string()))
    });

    Ok(handle)
}
