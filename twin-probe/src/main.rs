//! Twin Probe - liveness agent for one physical device
//!
//! Runs next to (or on) a physical device and watches the peers it is expected
//! to reach:
//! - ICMP ping from the host, optionally from a bound source address
//! - CLI ping from inside the router for router devices
//! - MQTT recent-message and RTSP fallbacks before declaring a peer dead
//! - Debounced UP/DOWN transitions published on `<prefix>/<device>/<peer>`

mod agent;
mod checks;
mod router;

use crate::agent::ProbeAgent;
use crate::checks::{FallbackProbe, PingCheck};
use crate::router::{check_limit, RouterCliPing};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use twin_common::bus::{mqtt_options, MqttHealthPublisher};
use twin_common::cli::{IosSettings, ReadWindow};
use twin_common::liveness::{LivenessCheck, PeerTarget};
use twin_common::ping::SystemPing;
use twin_common::remote::SshPool;
use twin_common::ssh::{SshEndpoint, SshTimeouts};
use twin_common::telemetry::init_tracing;
use twin_common::{DeviceConf, DeviceType, Topology};

#[derive(Debug, Parser)]
#[command(name = "twin-probe", about = "Report peer liveness of one physical device")]
struct Cli {
    /// Topology file (falls back to $TWIN_CONFIG, then devices.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device this probe speaks for
    #[arg(short, long)]
    device: String,

    /// Source address for probes, overriding the device's configured bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Run a single tick, publish its transitions and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("twin_probe=info,twin_common=info");
    let cli = Cli::parse();

    let path = Topology::resolve_path(cli.config.as_deref());
    let topology = Topology::load(&path)
        .await
        .with_context(|| format!("Failed to load topology from {}", path.display()))?;
    let device = topology
        .device(&cli.device)
        .cloned()
        .with_context(|| format!("Device '{}' is not in {}", cli.device, path.display()))?;

    let targets = PeerTarget::for_device(&topology, &device.name);
    if targets.is_empty() {
        warn!(device = %device.name, "no peers configured, nothing to watch");
    }

    let bind = cli.bind.or(device.bind);
    let (primary, check_timeout) = primary_check(&topology, &device, bind)?;
    let mqtt_host = topology.mqtt_host()?;
    let monitor = &topology.monitor;
    let fallback_window = Duration::from_secs(monitor.fallback_timeout_seconds);
    let fallback = FallbackProbe::new(&device.name, topology.mqtt.clone(), mqtt_host.clone(), fallback_window);

    let mut agent = ProbeAgent::new(
        &device.name,
        topology.prefix(),
        targets,
        monitor.probe_thresholds(),
        primary,
        check_timeout,
    )
    .with_fallback(Box::new(fallback), fallback_window + Duration::from_secs(1));

    let client_id = topology.mqtt.client_id.clone().unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("twin-probe-{}-{}", device.name, &suffix[..8])
    });
    let publisher = MqttHealthPublisher::connect(mqtt_options(&topology.mqtt, &mqtt_host, &client_id));
    info!(device = %device.name, broker = %mqtt_host, bind = ?bind, "probe starting");

    if cli.once {
        let events = agent.step().await;
        agent.publish(&publisher, events).await;
        if agent.unsent() > 0 {
            warn!(unsent = agent.unsent(), "exiting with unpublished transitions");
        }
        agent.close().await;
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        });
        agent.run(&publisher, monitor.probe_interval(), shutdown_rx).await;
    }

    publisher.disconnect().await;
    Ok(())
}

/// Router devices are probed from their own CLI; everything else by ICMP.
fn primary_check(topology: &Topology, device: &DeviceConf, bind: Option<IpAddr>) -> Result<(Box<dyn LivenessCheck>, Duration)> {
    if device.kind != DeviceType::Router {
        let monitor = &topology.monitor;
        let ping = SystemPing::new(monitor.ping_count, Duration::from_secs(monitor.ping_timeout_seconds));
        return Ok((Box::new(PingCheck::new(ping, bind)), monitor.ping_deadline() + Duration::from_secs(1)));
    }

    let login = device
        .physical_login()
        .with_context(|| format!("Router '{}' needs credentials for the CLI probe", device.name))?;
    let ssh = &topology.ssh;
    let timeouts = SshTimeouts {
        connect: Duration::from_secs(ssh.connect_timeout_seconds),
        command: Duration::from_secs(ssh.command_timeout_seconds),
        keepalive: Some(Duration::from_secs(topology.router.keepalive_seconds)),
    };
    let endpoint = SshEndpoint {
        host: device.physical,
        port: ssh.port,
        bind,
        user: login.user.clone(),
        password: login.password.clone(),
    };
    let settings = IosSettings {
        enable_secret: login.enable_secret().to_string(),
        privilege_attempts: topology.router.privilege_attempts,
        window: ReadWindow::new(Duration::from_millis(800), timeouts.connect),
        ..IosSettings::default()
    };
    let pool = SshPool::new(timeouts, topology.router.reconnect.policy());
    let check = RouterCliPing::new(pool, endpoint, settings, &topology.router);
    Ok((Box::new(check), check_limit(&topology.router, timeouts.connect)))
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
