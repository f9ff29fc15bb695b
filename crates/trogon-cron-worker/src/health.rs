//! Health check endpoint

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::EngineHandle;
use crate::error::WorkerError;
use crate::executor::RunningJobs;
use crate::feed::{FeedHealth, FeedName, FeedStatus};

#[derive(Clone)]
pub struct HealthState {
    pub feeds: FeedHealth,
    pub engine: EngineHandle,
    pub running: RunningJobs,
    pub started: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub feeds: BTreeMap<FeedName, FeedStatus>,
    /// Absent when the engine has stopped.
    pub jobs: Option<usize>,
    pub commands: Option<usize>,
    pub running: usize,
    pub uptime_secs: u64,
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let stats = state.engine.stats().await;
    let healthy = stats.is_some() && state.feeds.is_healthy();

    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" },
        feeds: state.feeds.snapshot(),
        jobs: stats.map(|s| s.jobs),
        commands: stats.map(|s| s.commands),
        running: state.running.len(),
        uptime_secs: state.started.elapsed().as_secs(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn live_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Serve `/health` and `/live` on `port` until `shutdown` fires.
pub async fn serve(state: HealthState, port: u16, shutdown: CancellationToken) -> Result<(), WorkerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
