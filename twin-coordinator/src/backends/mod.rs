//! Enforcement and power backends wired from the topology

pub mod dry_run;
pub mod ios;
pub mod linux;
pub mod orchestrator;

use self::dry_run::{DryRunEnforcer, DryRunLinks, DryRunPower};
use self::ios::IosRouteBackend;
use self::linux::LinuxFirewallBackend;
use self::orchestrator::OrchestratorClient;
use anyhow::{Context, Result};
use std::time::Duration;
use twin_common::cli::{IosSettings, ReadWindow};
use twin_common::enforcement::{BackendKind, EnforcementBackend, LinkBackend, PowerBackend};
use twin_common::remote::SshPool;
use twin_common::ssh::SshTimeouts;
use twin_common::Topology;

/// Everything the coordinator dispatches to. Each backend owns its sessions.
pub struct Backends {
    pub linux: Box<dyn EnforcementBackend>,
    pub ios: Box<dyn EnforcementBackend>,
    pub power: Option<Box<dyn PowerBackend>>,
    /// Only set when the orchestrator section asks for link suspension.
    pub links: Option<Box<dyn LinkBackend>>,
}

impl Backends {
    pub fn for_kind(&mut self, kind: BackendKind) -> &mut dyn EnforcementBackend {
        match kind {
            BackendKind::LinuxFirewall => self.linux.as_mut(),
            BackendKind::IosRoute => self.ios.as_mut(),
        }
    }

    pub async fn close(&mut self) {
        self.linux.close().await;
        self.ios.close().await;
    }

    pub fn dry_run(with_power: bool, with_links: bool) -> Self {
        Self {
            linux: Box::new(DryRunEnforcer::new(BackendKind::LinuxFirewall)),
            ios: Box::new(DryRunEnforcer::new(BackendKind::IosRoute)),
            power: with_power.then(|| Box::new(DryRunPower::default()) as Box<dyn PowerBackend>),
            links: with_links.then(|| Box::new(DryRunLinks) as Box<dyn LinkBackend>),
        }
    }

    pub fn from_topology(topology: &Topology) -> Result<Self> {
        let ssh = &topology.ssh;
        let timeouts = SshTimeouts {
            connect: Duration::from_secs(ssh.connect_timeout_seconds),
            command: Duration::from_secs(ssh.command_timeout_seconds),
            keepalive: None,
        };
        let policy = topology.router.reconnect.policy();

        let linux = LinuxFirewallBackend::new(SshPool::new(timeouts, policy), topology.monitor.iptables_chain.clone());

        let ios_settings = IosSettings {
            privilege_attempts: topology.router.privilege_attempts,
            window: ReadWindow::new(Duration::from_millis(800), timeouts.command),
            ..IosSettings::default()
        };
        let router_timeouts = SshTimeouts {
            keepalive: Some(Duration::from_secs(topology.router.keepalive_seconds)),
            ..timeouts
        };
        let ios = IosRouteBackend::new(
            SshPool::new(router_timeouts, policy),
            ios_settings,
            topology.router.persist_config,
        );

        let (power, links) = match &topology.orchestrator {
            Some(conf) => {
                let client = OrchestratorClient::new(conf).context("Failed to build orchestrator client")?;
                let links = conf.suspend_links.then(|| Box::new(client.clone()) as Box<dyn LinkBackend>);
                (Some(Box::new(client) as Box<dyn PowerBackend>), links)
            }
            None => (None, None),
        };

        Ok(Self { linux: Box::new(linux), ios: Box::new(ios), power, links })
    }
}
