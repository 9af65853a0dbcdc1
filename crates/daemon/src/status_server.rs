//! Status HTTP server
//!
//! Exposes the latest [`StatusReport`] as JSON for dashboards and scripts.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::cancellation::CancellationToken;
use crate::report::{SharedStatus, StatusReport};

/// Address the daemon serves status on unless told otherwise
pub const DEFAULT_STATUS_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 7879);

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusReport> {
    let report = status.read().clone();
    Json(report)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Serve `status` on `addr` until `token` is cancelled.
pub async fn run_status_server(
    status: SharedStatus,
    addr: SocketAddr,
    token: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    Ok(())
}
