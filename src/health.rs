//! Status endpoints
//!
//! `/healthz` for probes and `/status` with the report of the last sync cycle.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::CycleReport;

type Reports = watch::Receiver<Option<CycleReport>>;

pub fn router(reports: Reports) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/status", get(status))
        .with_state(reports)
}

/// Serve the status endpoints until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, reports: Reports, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server to {}", addr))?;

    info!("Status server listening on {}", addr);

    axum::serve(listener, router(reports))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Status server failed")?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": crate::version::NAME,
        "version": crate::version::VERSION
    }))
}

async fn status(State(reports): State<Reports>) -> Json<Option<CycleReport>> {
    let report = reports.borrow().clone();
    Json(report)
}
