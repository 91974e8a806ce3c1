//! Status HTTP server
//!
//! Exposes the supervisor status on loopback for the web panel and for
//! operators with `curl`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::status::{unix_ms_now, MetricsSampler, SharedStatus, StatusSnapshot};
use tracing::warn;

/// Default port of the stream supervisor's status endpoint
pub const STATUS_PORT: u16 = 8082;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let mut snapshot = status.read().await.clone();
    snapshot.timestamp_unix_ms = unix_ms_now();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Runs the status HTTP server on 127.0.0.1:`port`
pub async fn run_status_server(status: SharedStatus, port: u16) -> Result<(), ServerError> {
    let app = create_status_router(status);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically refreshes device and child usage in the shared status
pub async fn run_system_metrics_updater(status: SharedStatus, every: Duration) {
    let mut sampler = MetricsSampler::default();
    loop {
        let pid = status.read().await.supervisor.pid;
        let mut current = std::mem::take(&mut sampler);
        let sampled = tokio::task::spawn_blocking(move || {
            let metrics = current.sample(pid);
            (current, metrics)
        })
        .await;
        match sampled {
            Ok((kept, metrics)) => {
                sampler = kept;
                status.write().await.system = metrics;
            }
            Err(e) => warn!(error = %e, "Metrics sampling failed"),
        }
        tokio::time::sleep(every).await;
    }
}
