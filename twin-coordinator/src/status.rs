//! Read-only status endpoint
//!
//! The coordinator rewrites the snapshot after every tick; handlers only read
//! it. Routes: `GET /health` (liveness of the service itself) and
//! `GET /status` (devices, reports, enforcement rules, bus connection).

use crate::health::{BusHealth, BusView};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use twin_common::enforcement::BackendKind;
use twin_common::{PairKey, SettledState};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub devices: BTreeMap<String, DeviceView>,
    pub reports: Vec<ReportView>,
    pub pairs: Vec<PairView>,
    pub rules: Vec<RuleView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub state: SettledState,
    pub node_running: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportView {
    pub source: String,
    pub target: String,
    pub state: SettledState,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairView {
    pub pair: PairKey,
    pub blocked: bool,
    /// `None` when link suspension is off or not yet known for the pair.
    pub links_suspended: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleView {
    pub enforcer: String,
    pub peer: String,
    pub backend: BackendKind,
    pub applied: Option<bool>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct StatusState {
    pub snapshot: Shared<StatusSnapshot>,
    pub bus: BusHealth,
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    snapshot: StatusSnapshot,
    bus: BusView,
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let body = StatusBody { snapshot: state.snapshot.lock().clone(), bus: state.bus.view() };
    Json(serde_json::to_value(body).unwrap_or_default())
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn spawn_status_server(
    addr: SocketAddr,
    state: StatusState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status endpoint listening");
    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "status endpoint failed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_serves_snapshot_and_bus() {
        let snapshot = new_shared(StatusSnapshot::default());
        snapshot.lock().devices.insert(
            "sensor".into(),
            DeviceView { state: SettledState::Down, node_running: Some(false) },
        );
        let state = StatusState { snapshot, bus: BusHealth::new() };

        let Json(body) = status(State(state)).await;
        assert_eq!(body["devices"]["sensor"]["state"], "DOWN");
        assert_eq!(body["bus"]["status"], "connecting");
        assert_eq!(body["dry_run"], false);
    }

    #[tokio::test]
    async fn test_server_binds_and_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let state = StatusState { snapshot: new_shared(StatusSnapshot::default()), bus: BusHealth::new() };
        let handle = spawn_status_server("127.0.0.1:0".parse().unwrap(), state, rx).await.unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
