/// Local HTTP listener.
///
/// Accepts gateway events pushed over HTTP POST (fed into the same queue as
/// WebSocket events) and reports process health.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use jm_shared::errors::{BotError, BotResult};
use jm_shared::job::{JobTracker, TrackedJob};

/// First port tried when the configured one is taken.
pub const PORT_SCAN_START: u16 = 10000;

pub struct ServerState {
    pub events: mpsc::UnboundedSender<Value>,
    pub gateway_connected: Arc<AtomicBool>,
    pub jobs: JobTracker,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub gateway_connected: bool,
    pub active_jobs: usize,
    pub jobs: Vec<TrackedJob>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", post(receive_event))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn receive_event(State(state): State<Arc<ServerState>>, Json(event): Json<Value>) -> StatusCode {
    if state.events.send(event).is_err() {
        warn!("Dispatcher gone, rejecting pushed event");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::NO_CONTENT
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let jobs = state.jobs.snapshot().await;
    Json(HealthResponse {
        status: "ok",
        gateway_connected: state.gateway_connected.load(Ordering::SeqCst),
        active_jobs: jobs.len(),
        jobs,
    })
}

/// Bind `host:preferred`, falling back to the first free port from
/// [`PORT_SCAN_START`] up. The whole search is tried `attempts` times, one
/// second apart.
pub async fn bind_listener(host: &str, preferred: u16, attempts: u32) -> BotResult<TcpListener> {
    for attempt in 1..=attempts {
        match TcpListener::bind((host, preferred)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!("Cannot bind {}:{} ({}), scanning for a free port", host, preferred, e),
        }
        for port in PORT_SCAN_START..=u16::MAX {
            if let Ok(listener) = TcpListener::bind((host, port)).await {
                info!("Using fallback port {}", port);
                return Ok(listener);
            }
        }
        if attempt < attempts {
            warn!("No free port on {} (attempt {}/{})", host, attempt, attempts);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    Err(BotError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free port on {} after {} attempts", host, attempts),
    )))
}
