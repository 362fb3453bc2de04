/**
 * TWIN COORDINATOR - entry point of the reconciliation service
 *
 * ROLE: loads the topology, wires the backends, then runs the single-writer
 * coordinator loop fed by the MQTT health listener and its own device pings.
 *
 * ARCHITECTURE: bus listener -> bounded channel -> coordinator task
 * (+ timer tick) -> enforcement / power backends. Optional read-only status
 * endpoint over HTTP.
 */

mod backends;
mod bus;
mod coordinator;
mod health;
mod status;

use crate::backends::Backends;
use crate::coordinator::Coordinator;
use crate::health::BusHealth;
use crate::status::{new_shared, spawn_status_server, StatusSnapshot, StatusState};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use twin_common::bus::mqtt_options;
use twin_common::ping::SystemPing;
use twin_common::telemetry::init_tracing;
use twin_common::Topology;

#[derive(Debug, Parser)]
#[command(name = "twin-coordinator", about = "Keep the digital twin in step with the physical network")]
struct Cli {
    /// Topology file (falls back to $TWIN_CONFIG, then devices.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every decision but leave devices, firewalls and nodes untouched
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("twin_coordinator=info,twin_common=info");
    let cli = Cli::parse();

    let path = Topology::resolve_path(cli.config.as_deref());
    let topology = Topology::load(&path)
        .await
        .with_context(|| format!("Failed to load topology from {}", path.display()))?;
    info!(config = %path.display(), devices = topology.devices.len(), "topology loaded");

    let backends = if cli.dry_run {
        let orchestrator = topology.orchestrator.as_ref();
        Backends::dry_run(orchestrator.is_some(), orchestrator.is_some_and(|o| o.suspend_links))
    } else {
        Backends::from_topology(&topology)?
    };
    let pinger = SystemPing::new(
        topology.monitor.ping_count,
        Duration::from_secs(topology.monitor.ping_timeout_seconds),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(topology.monitor.event_queue_depth);
    let bus_health = BusHealth::new();

    let client_id = topology
        .mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| format!("twin-coordinator-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let opts = mqtt_options(&topology.mqtt, &topology.mqtt_host()?, &client_id);
    let listener = bus::spawn_bus_listener(
        opts,
        topology.prefix().to_string(),
        event_tx,
        bus_health.clone(),
        shutdown_rx.clone(),
    );

    let snapshot = new_shared(StatusSnapshot { dry_run: cli.dry_run, ..StatusSnapshot::default() });
    let status_server = match topology.monitor.status_listen {
        Some(addr) => {
            let state = StatusState { snapshot: snapshot.clone(), bus: bus_health.clone() };
            Some(spawn_status_server(addr, state, shutdown_rx.clone()).await?)
        }
        None => None,
    };

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let coordinator = Coordinator::new(topology, backends, Box::new(pinger), snapshot).with_dry_run(cli.dry_run);
    coordinator.run(event_rx, shutdown_rx).await;

    if let Err(e) = listener.await {
        warn!(error = %e, "bus listener ended abnormally");
    }
    if let Some(server) = status_server {
        let _ = server.await;
    }
    info!("coordinator stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
