//! Health endpoint
//!
//! `GET /health` reports process uptime, resident memory and the state of
//! the current worker generation. 200 while the worker polls, 503 otherwise.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use replug_core::worker::WorkerLifecycleManager;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared state for the health handler.
#[derive(Clone)]
pub struct HealthState {
    manager: Arc<WorkerLifecycleManager>,
    started: Instant,
}

impl HealthState {
    pub fn new(manager: Arc<WorkerLifecycleManager>) -> Self {
        Self {
            manager,
            started: Instant::now(),
        }
    }
}

/// Build the health router.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve the health endpoint until the process exits.
pub async fn serve(port: u16, state: HealthState) {
    let app = router(state);
    match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            info!(port, "health endpoint listening");
            if let Err(error) = axum::serve(listener, app).await {
                warn!(%error, "health endpoint stopped");
            }
        }
        Err(error) => warn!(port, %error, "cannot bind health endpoint"),
    }
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<serde_json::Value>) {
    let running = state.manager.is_running();
    let set = state.manager.current_registration();

    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if running { "healthy" } else { "unhealthy" },
        "uptime_seconds": state.started.elapsed().as_secs(),
        "memory": { "resident_bytes": resident_memory_bytes() },
        "worker": {
            "is_running": running,
            "epoch": state.manager.epoch(),
            "task_kinds": set.task_kinds(),
            "workflow_kinds": set.workflow_kinds(),
        }
    });
    (status, Json(body))
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}
