//! Reconciliation coordinator
//!
//! One task owns every tracker and rule. Bus events arrive over a bounded
//! channel, device pings run on the timer tick, and both paths end in the
//! same level-triggered reconcile: compute the desired state of a flow and
//! call the backend only when the applied state differs.
//!
//! Within a tick, device decisions (pings, then power) are made before any
//! flow is reconciled, so a connection recovery is always weighed against
//! the current device states.
//!
//! A report `source -> target` is enforced on the source's twin only. Both
//! directions of a pair are cut only when a whole device is DOWN.
//!
//! With link suspension enabled, the orchestrator links of a pair are a
//! second layer: suspended while either side is DOWN or either direction is
//! reported DOWN, resumed once neither holds.

use crate::backends::Backends;
use crate::status::{DeviceView, PairView, ReportView, RuleView, Shared, StatusSnapshot};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use twin_common::enforcement::{BackendKind, EnforcementTarget};
use twin_common::error::SyncError;
use twin_common::ping::Reachability;
use twin_common::ssh::SshEndpoint;
use twin_common::{DebounceTracker, HealthEvent, PairKey, SettledState, Topology};

/// Traffic from `enforcer`'s digital twin towards `peer`'s digital twin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub enforcer: String,
    pub peer: String,
}

impl FlowKey {
    pub fn new(enforcer: &str, peer: &str) -> Self {
        Self { enforcer: enforcer.to_string(), peer: peer.to_string() }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.enforcer, self.peer)
    }
}

#[derive(Debug, Clone)]
pub struct EnforcementRule {
    pub flow: FlowKey,
    pub backend: BackendKind,
    /// `None` until the backend has been asked at least once.
    pub applied: Option<bool>,
    pub last_error: Option<String>,
}

/// Orchestrator links of one pair, as this run last left them.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    /// Not looked up since start; a previous run may have left links suspended.
    Unknown,
    Open,
    Suspended(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Desired {
    Block(String),
    Unblock,
    /// The enforcer's own twin is powered off; leave its rules alone.
    Hold,
}

pub struct Coordinator {
    topology: Topology,
    backends: Backends,
    pinger: Box<dyn Reachability>,
    devices: BTreeMap<String, DebounceTracker>,
    reports: BTreeMap<(String, String), DebounceTracker>,
    rules: BTreeMap<FlowKey, EnforcementRule>,
    links: BTreeMap<PairKey, LinkState>,
    node_running: HashMap<String, bool>,
    status: Shared<StatusSnapshot>,
    dry_run: bool,
}

impl Coordinator {
    pub fn new(topology: Topology, backends: Backends, pinger: Box<dyn Reachability>, status: Shared<StatusSnapshot>) -> Self {
        let device_th = topology.monitor.device_thresholds();
        let devices = topology
            .devices
            .keys()
            .map(|name| (name.clone(), DebounceTracker::new(device_th)))
            .collect();

        let mut rules = BTreeMap::new();
        for enforcer in topology.devices.values() {
            let Some(backend) = BackendKind::for_device(enforcer.kind) else {
                continue;
            };
            if enforcer.credentials.is_none() {
                warn!(device = %enforcer.name, %backend, "no credentials, flows from this device cannot be enforced");
                continue;
            }
            for peer in topology.devices.keys().filter(|p| **p != enforcer.name) {
                let flow = FlowKey::new(&enforcer.name, peer);
                rules.insert(flow.clone(), EnforcementRule { flow, backend, applied: None, last_error: None });
            }
        }

        let mut links = BTreeMap::new();
        if backends.links.is_some() {
            let nodes: Vec<&str> = topology
                .devices
                .values()
                .filter(|d| d.node_id.is_some())
                .map(|d| d.name.as_str())
                .collect();
            for (i, a) in nodes.iter().enumerate() {
                for b in &nodes[i + 1..] {
                    links.insert(PairKey::new(a, b), LinkState::Unknown);
                }
            }
        }

        Self {
            topology,
            backends,
            pinger,
            devices,
            reports: BTreeMap::new(),
            rules,
            links,
            node_running: HashMap::new(),
            status,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn device_state(&self, name: &str) -> Option<SettledState> {
        self.devices.get(name).map(DebounceTracker::state)
    }

    pub fn rule(&self, enforcer: &str, peer: &str) -> Option<&EnforcementRule> {
        self.rules.get(&FlowKey::new(enforcer, peer))
    }

    /// Pairs with at least one direction currently blocked.
    pub fn blocked_pairs(&self) -> BTreeSet<PairKey> {
        self.rules
            .values()
            .filter(|r| r.applied == Some(true))
            .map(|r| PairKey::new(&r.flow.enforcer, &r.flow.peer))
            .collect()
    }

    /// Learn what the backends already enforce, so a restart neither
    /// duplicates nor forgets isolation left by a previous run.
    pub async fn init(&mut self) {
        info!(
            devices = self.devices.len(),
            flows = self.rules.len(),
            dry_run = self.dry_run,
            "coordinator starting"
        );
        let keys: Vec<FlowKey> = self.rules.keys().cloned().collect();
        for key in keys {
            let Some(backend) = self.rules.get(&key).map(|r| r.backend) else {
                continue;
            };
            let Some(target) = self.target(&key, backend) else {
                continue;
            };
            let verified = self.backends.for_kind(backend).is_blocked(&target).await;
            let Some(rule) = self.rules.get_mut(&key) else {
                continue;
            };
            match verified {
                Ok(blocked) => {
                    if blocked {
                        info!(flow = %key, %backend, "found existing block");
                    }
                    rule.applied = Some(blocked);
                }
                Err(e) => {
                    warn!(flow = %key, %backend, class = e.class(), error = %e, "could not verify flow at startup");
                    rule.last_error = Some(e.to_string());
                }
            }
        }

        if let Some(power) = self.backends.power.as_mut() {
            for dev in self.topology.devices.values() {
                let Some(node) = dev.node_id.as_deref() else {
                    continue;
                };
                match power.get_state(node).await {
                    Ok(state) => {
                        self.node_running.insert(dev.name.clone(), state.is_running());
                    }
                    Err(e) => warn!(device = %dev.name, node, error = %e, "could not read node state"),
                }
            }
        }
        self.publish_status();
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<HealthEvent>, mut shutdown: watch::Receiver<bool>) {
        self.init().await;
        let mut ticker = interval(self.topology.monitor.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = inbox.recv() => self.handle_event(event).await,
                _ = ticker.tick() => self.tick().await,
            }
        }
        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        info!("coordinator stopping, closing backend sessions");
        self.backends.close().await;
    }

    /// One timer tick: device pings, power, every flow, then every link.
    pub async fn tick(&mut self) {
        self.check_devices().await;
        self.sync_power().await;
        let keys: Vec<FlowKey> = self.rules.keys().cloned().collect();
        for key in &keys {
            self.reconcile_flow(key).await;
        }
        let pairs: Vec<PairKey> = self.links.keys().cloned().collect();
        for pair in &pairs {
            self.reconcile_link(pair).await;
        }
        self.publish_status();
    }

    /// Fold one bus report into its directed tracker and reconcile the
    /// source's flow towards the target when the report settles.
    pub async fn handle_event(&mut self, event: HealthEvent) {
        if self.topology.device(&event.source).is_none() || self.topology.device(&event.target).is_none() {
            debug!(source = %event.source, target = %event.target, "report for unknown device ignored");
            return;
        }
        let th = self.topology.monitor.connection_thresholds();
        let tracker = self
            .reports
            .entry((event.source.clone(), event.target.clone()))
            .or_insert_with(|| DebounceTracker::new(th));
        let Some(transition) = tracker.update(event.status.is_up()) else {
            return;
        };
        info!(
            source = %event.source,
            target = %event.target,
            %transition,
            reported_at = %event.time,
            "connection report settled"
        );

        let key = FlowKey::new(&event.source, &event.target);
        if self.rules.contains_key(&key) {
            self.reconcile_flow(&key).await;
        } else {
            warn!(flow = %key, "no enforcement configured for the reporting device");
        }
        self.reconcile_link(&PairKey::new(&event.source, &event.target)).await;
        self.publish_status();
    }

    async fn check_devices(&mut self) {
        let probes: Vec<_> = self
            .topology
            .devices
            .values()
            .map(|d| (d.name.clone(), d.physical, d.bind))
            .collect();
        let pinger = self.pinger.as_ref();
        let results = join_all(probes.iter().map(|(_, addr, bind)| pinger.reachable(*addr, *bind))).await;

        for ((name, addr, _), ok) in probes.iter().zip(results) {
            let Some(tracker) = self.devices.get_mut(name) else {
                continue;
            };
            let Some(transition) = tracker.update(ok) else {
                continue;
            };
            if transition.to == SettledState::Down {
                warn!(device = %name, %addr, %transition, "device unreachable from coordinator");
            } else {
                info!(device = %name, %addr, %transition, "device reachable");
            }
            // power state must be re-read after every device transition
            self.node_running.remove(name);
        }
    }

    /// Level-triggered: whenever a settled device and its node disagree, fix the node.
    async fn sync_power(&mut self) {
        let Some(power) = self.backends.power.as_mut() else {
            return;
        };
        for dev in self.topology.devices.values() {
            let Some(node) = dev.node_id.as_deref() else {
                continue;
            };
            let want_running = match self.devices.get(&dev.name).map(DebounceTracker::state) {
                Some(SettledState::Up) => true,
                Some(SettledState::Down) => false,
                _ => continue,
            };
            if self.node_running.get(&dev.name) == Some(&want_running) {
                continue;
            }

            match power.get_state(node).await {
                Ok(state) if state.is_running() == want_running => {
                    self.node_running.insert(dev.name.clone(), want_running);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(device = %dev.name, node, class = e.class(), error = %e, "node state unavailable, retrying next tick");
                    continue;
                }
            }

            let (action, result) = if want_running {
                ("start", power.start(node).await)
            } else {
                ("stop", power.stop(node).await)
            };
            match result {
                Ok(()) => {
                    info!(device = %dev.name, node, action, "digital node power changed");
                    self.node_running.insert(dev.name.clone(), want_running);
                    if want_running {
                        // a restarted twin comes back without runtime rules
                        for rule in self.rules.values_mut().filter(|r| r.flow.enforcer == dev.name) {
                            rule.applied = None;
                        }
                    }
                }
                Err(e) => {
                    warn!(device = %dev.name, node, action, class = e.class(), error = %e, "power change failed, retrying next tick");
                    self.node_running.remove(&dev.name);
                }
            }
        }
    }

    fn is_down(&self, device: &str) -> bool {
        self.devices.get(device).is_some_and(DebounceTracker::is_down)
    }

    fn report_down(&self, source: &str, target: &str) -> bool {
        self.reports
            .get(&(source.to_string(), target.to_string()))
            .is_some_and(DebounceTracker::is_down)
    }

    fn desired(&self, key: &FlowKey) -> Desired {
        let (enforcer, peer) = (key.enforcer.as_str(), key.peer.as_str());
        if self.is_down(enforcer) && self.node_running.get(enforcer) == Some(&false) {
            return Desired::Hold;
        }
        if self.is_down(peer) {
            return Desired::Block(format!("device {peer} DOWN"));
        }
        if self.is_down(enforcer) {
            return Desired::Block(format!("device {enforcer} DOWN"));
        }
        if self.report_down(enforcer, peer) {
            return Desired::Block(format!("reported {enforcer}->{peer} DOWN"));
        }
        Desired::Unblock
    }

    fn link_wanted_down(&self, pair: &PairKey) -> bool {
        let (a, b) = pair.members();
        self.is_down(a) || self.is_down(b) || self.report_down(a, b) || self.report_down(b, a)
    }

    fn node_id(&self, device: &str) -> Option<String> {
        self.topology.device(device)?.node_id.clone()
    }

    /// Suspend or resume the orchestrator links of a pair. Link ids are
    /// remembered once suspended, so resuming needs no second lookup.
    async fn reconcile_link(&mut self, pair: &PairKey) {
        let Some(state) = self.links.get(pair).cloned() else {
            return;
        };
        let suspend = self.link_wanted_down(pair);
        if matches!((&state, suspend), (LinkState::Suspended(_), true) | (LinkState::Open, false)) {
            return;
        }
        let (a, b) = pair.members();
        let (Some(node_a), Some(node_b)) = (self.node_id(a), self.node_id(b)) else {
            return;
        };
        let Some(backend) = self.backends.links.as_mut() else {
            return;
        };

        let was_suspended = matches!(state, LinkState::Suspended(_));
        let (found, pending): (Vec<String>, Vec<String>) = match state {
            LinkState::Suspended(ids) => (Vec::new(), ids),
            LinkState::Unknown | LinkState::Open => match backend.links_between(&node_a, &node_b).await {
                Ok(links) => {
                    let pending: Vec<String> =
                        links.iter().filter(|l| l.suspended != suspend).map(|l| l.id.clone()).collect();
                    (links.into_iter().map(|l| l.id).collect(), pending)
                }
                Err(e) => {
                    warn!(%pair, class = e.class(), error = %e, "link lookup failed, retrying next tick");
                    return;
                }
            },
        };

        let mut failed = Vec::new();
        for link in pending {
            match backend.set_suspended(&link, suspend).await {
                Ok(()) => info!(%pair, %link, suspend, "link suspension applied"),
                Err(e) => {
                    warn!(%pair, %link, suspend, class = e.class(), error = %e, "link suspension failed, retrying next tick");
                    failed.push(link);
                }
            }
        }

        let next = match (suspend, failed.is_empty()) {
            (true, true) => {
                if found.is_empty() {
                    debug!(%pair, "no orchestrator link between the pair");
                }
                LinkState::Suspended(found)
            }
            (false, true) => LinkState::Open,
            (false, false) if was_suspended => LinkState::Suspended(failed),
            _ => return,
        };
        self.links.insert(pair.clone(), next);
    }

    fn target(&self, key: &FlowKey, backend: BackendKind) -> Option<EnforcementTarget> {
        let enforcer = self.topology.device(&key.enforcer)?;
        let peer = self.topology.device(&key.peer)?;
        let creds = enforcer.credentials.as_ref()?;
        let secret = match backend {
            BackendKind::IosRoute => creds.enable_secret(),
            BackendKind::LinuxFirewall => creds.password.as_str(),
        };
        Some(EnforcementTarget {
            enforcer: enforcer.name.clone(),
            peer: peer.name.clone(),
            peer_address: peer.digital,
            endpoint: SshEndpoint {
                host: enforcer.digital,
                port: self.topology.ssh.port,
                bind: enforcer.digital_bind,
                user: creds.user.clone(),
                password: creds.password.clone(),
            },
            secret: secret.to_string(),
        })
    }

    async fn reconcile_flow(&mut self, key: &FlowKey) {
        let (want_blocked, reason) = match self.desired(key) {
            Desired::Hold => return,
            Desired::Block(reason) => (true, reason),
            Desired::Unblock => (false, "connectivity restored".to_string()),
        };
        let Some(rule) = self.rules.get(key) else {
            return;
        };
        if rule.applied == Some(want_blocked) {
            return;
        }
        let backend = rule.backend;
        let Some(target) = self.target(key, backend) else {
            return;
        };

        let enforcer = self.backends.for_kind(backend);
        let result = if want_blocked {
            enforcer.block(&target).await
        } else {
            enforcer.unblock(&target).await
        };
        let action = if want_blocked { "block" } else { "unblock" };

        let Some(rule) = self.rules.get_mut(key) else {
            return;
        };
        match result {
            Ok(outcome) => {
                rule.applied = Some(want_blocked);
                rule.last_error = None;
                info!(
                    flow = %key,
                    %backend,
                    action,
                    reason = %reason,
                    changed = outcome.changed,
                    before = %outcome.before,
                    after = %outcome.after,
                    "enforcement applied"
                );
            }
            Err(e) => {
                rule.last_error = Some(e.to_string());
                log_failure(key, backend, action, &e);
            }
        }
    }

    fn publish_status(&self) {
        let devices = self
            .devices
            .iter()
            .map(|(name, t)| {
                let view = DeviceView { state: t.state(), node_running: self.node_running.get(name).copied() };
                (name.clone(), view)
            })
            .collect();
        let reports = self
            .reports
            .iter()
            .map(|((source, target), t)| ReportView { source: source.clone(), target: target.clone(), state: t.state() })
            .collect();
        let blocked = self.blocked_pairs();
        let pairs = self
            .topology
            .connection_pairs()
            .into_iter()
            .map(|pair| {
                let links_suspended = match self.links.get(&pair) {
                    Some(LinkState::Suspended(_)) => Some(true),
                    Some(LinkState::Open) => Some(false),
                    Some(LinkState::Unknown) | None => None,
                };
                PairView { blocked: blocked.contains(&pair), links_suspended, pair }
            })
            .collect();
        let rules = self
            .rules
            .values()
            .map(|r| RuleView {
                enforcer: r.flow.enforcer.clone(),
                peer: r.flow.peer.clone(),
                backend: r.backend,
                applied: r.applied,
                last_error: r.last_error.clone(),
            })
            .collect();

        *self.status.lock() = StatusSnapshot {
            updated_at: Some(Utc::now()),
            dry_run: self.dry_run,
            devices,
            reports,
            pairs,
            rules,
        };
    }
}

fn log_failure(key: &FlowKey, backend: BackendKind, action: &str, err: &SyncError) {
    let class = err.class();
    match err {
        SyncError::VerificationMismatch { before, after, .. } => {
            warn!(flow = %key, %backend, action, class, before = %before, after = %after, "verification mismatch, retrying next tick");
        }
        SyncError::Authentication { host, user } => {
            error!(flow = %key, %backend, action, class, %host, %user, "authentication failed, retrying next tick");
        }
        SyncError::ProtocolParse { transcript, .. } => {
            warn!(flow = %key, %backend, action, class, error = %err, transcript = %transcript, "cli rejected change, retrying next tick");
        }
        _ => warn!(flow = %key, %backend, action, class, error = %err, "enforcement failed, retrying next tick"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::new_shared;
    use std::net::IpAddr;
    use std::time::Duration;
    use twin_common::HealthStatus;
    use twin_devkit::fixtures::SAMPLE_TOPOLOGY;
    use twin_common::enforcement::LinkBackend;
    use twin_devkit::test_utils::{
        init_test_logging, wait_until, EnforcerLog, LinkLog, PowerLog, RecordingEnforcer, RecordingLinks, RecordingPower,
        ScriptedReachability,
    };

    struct Harness {
        coordinator: Coordinator,
        linux: EnforcerLog,
        ios: EnforcerLog,
        power: PowerLog,
        reach: ScriptedReachability,
        links: LinkLog,
    }

    fn harness() -> Harness {
        build(false)
    }

    /// Same lab with link suspension on. Sensor-broker, router-sensor and
    /// camera-broker are wired; every other pair has no link.
    fn harness_with_links() -> Harness {
        build(true)
    }

    fn build(with_links: bool) -> Harness {
        let topology = Topology::from_yaml(SAMPLE_TOPOLOGY).unwrap();
        let (linux_backend, linux) = RecordingEnforcer::new(BackendKind::LinuxFirewall);
        let (ios_backend, ios) = RecordingEnforcer::new(BackendKind::IosRoute);
        let (power_backend, power) = RecordingPower::new();
        let (links_backend, links) = RecordingLinks::new();
        links.add_link("l-sb", "node-sensor", "node-broker");
        links.add_link("l-rs", "node-router", "node-sensor");
        links.add_link("l-cb", "node-cam", "node-broker");
        let reach = ScriptedReachability::default();
        let backends = Backends {
            linux: Box::new(linux_backend),
            ios: Box::new(ios_backend),
            power: Some(Box::new(power_backend)),
            links: with_links.then(|| Box::new(links_backend) as Box<dyn LinkBackend>),
        };
        let coordinator = Coordinator::new(topology, backends, Box::new(reach.clone()), new_shared(StatusSnapshot::default()));
        Harness { coordinator, linux, ios, power, reach, links }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn report(source: &str, target: &str, status: HealthStatus) -> HealthEvent {
        HealthEvent::new(source, target, status)
    }

    /// Bring every device to a settled UP state (device thresholds are 3/3).
    async fn settle(h: &mut Harness) {
        h.coordinator.init().await;
        for _ in 0..3 {
            h.coordinator.tick().await;
        }
    }

    #[tokio::test]
    async fn test_reported_link_down_blocks_exactly_that_pair() {
        let mut h = harness();
        settle(&mut h).await;
        assert!(h.coordinator.blocked_pairs().is_empty());
        assert_eq!(h.coordinator.device_state("sensor"), Some(SettledState::Up));

        let ev = HealthEvent::from_message(
            "health",
            "health/sensor/broker",
            br#"{"status":"DOWN","time":"2024-01-01T00:00:00"}"#,
        )
        .unwrap();
        h.coordinator.handle_event(ev).await;

        let blocked = h.coordinator.blocked_pairs();
        assert_eq!(blocked.into_iter().collect::<Vec<_>>(), vec![PairKey::new("sensor", "broker")]);
        assert_eq!(h.linux.blocked(), [("sensor".to_string(), "broker".to_string())].into_iter().collect());
        assert_eq!(h.coordinator.rule("broker", "sensor").unwrap().applied, Some(false));
        assert!(h.ios.blocked().is_empty());
        assert!(h.power.calls().iter().all(|c| !c.starts_with("stop")));

        // a later tick with everything reachable keeps the block
        h.coordinator.tick().await;
        assert_eq!(h.coordinator.blocked_pairs().len(), 1);

        h.coordinator.handle_event(report("sensor", "broker", HealthStatus::Up)).await;
        assert!(h.coordinator.blocked_pairs().is_empty());
        assert!(h.linux.blocked().is_empty());
    }

    #[tokio::test]
    async fn test_report_is_enforced_on_the_reporting_device_only() {
        let mut h = harness();
        settle(&mut h).await;
        let linux_calls = h.linux.calls().len();

        h.coordinator.handle_event(report("router", "sensor", HealthStatus::Down)).await;
        assert_eq!(h.ios.blocked(), [("router".to_string(), "sensor".to_string())].into_iter().collect());
        assert!(h.linux.blocked().is_empty(), "sensor's firewall must not answer a router report");
        assert_eq!(h.linux.calls().len(), linux_calls);
        assert_eq!(h.coordinator.rule("sensor", "router").unwrap().applied, Some(false));

        // the camera has no backend, so its report is recorded and nothing else
        let ios_calls = h.ios.calls().len();
        h.coordinator.handle_event(report("ipcam", "broker", HealthStatus::Down)).await;
        assert_eq!(h.linux.calls().len(), linux_calls);
        assert_eq!(h.ios.calls().len(), ios_calls);
        assert!(!h.coordinator.blocked_pairs().contains(&PairKey::new("ipcam", "broker")));
        assert_eq!(h.coordinator.status.lock().reports.len(), 2);

        // a later tick does not widen either report to the reverse flow
        h.coordinator.tick().await;
        assert!(h.linux.blocked().is_empty());
        assert_eq!(h.coordinator.blocked_pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_device_down_blocks_every_pair_and_stops_node() {
        let mut h = harness();
        settle(&mut h).await;

        h.reach.set(addr("192.168.20.4"), false);
        h.coordinator.tick().await;
        h.coordinator.tick().await;
        assert!(h.coordinator.blocked_pairs().is_empty(), "must not act before the threshold");
        h.coordinator.tick().await;

        assert_eq!(h.coordinator.device_state("ipcam"), Some(SettledState::Down));
        let blocked = h.coordinator.blocked_pairs();
        for other in ["broker", "sensor", "router"] {
            assert!(blocked.contains(&PairKey::new("ipcam", other)), "ipcam<->{other} not blocked");
        }
        assert_eq!(blocked.len(), 3);
        assert!(h.ios.blocked().contains(&("router".to_string(), "ipcam".to_string())));
        assert!(h.power.calls().contains(&"stop node-cam".to_string()));

        h.reach.set(addr("192.168.20.4"), true);
        for _ in 0..3 {
            h.coordinator.tick().await;
        }
        assert!(h.coordinator.blocked_pairs().is_empty());
        assert!(h.power.calls().contains(&"start node-cam".to_string()));
    }

    #[tokio::test]
    async fn test_recovery_report_does_not_override_device_down() {
        let mut h = harness();
        settle(&mut h).await;

        h.reach.set(addr("192.168.20.2"), false);
        for _ in 0..3 {
            h.coordinator.tick().await;
        }
        assert!(h.coordinator.blocked_pairs().contains(&PairKey::new("sensor", "broker")));

        h.coordinator.handle_event(report("sensor", "broker", HealthStatus::Down)).await;
        h.coordinator.handle_event(report("sensor", "broker", HealthStatus::Up)).await;
        assert!(h.coordinator.blocked_pairs().contains(&PairKey::new("sensor", "broker")));
        assert_eq!(h.coordinator.rule("sensor", "broker").unwrap().applied, Some(true));
    }

    #[tokio::test]
    async fn test_stopped_enforcer_flows_are_held() {
        let mut h = harness();
        settle(&mut h).await;

        h.reach.set(addr("192.168.20.2"), false);
        for _ in 0..3 {
            h.coordinator.tick().await;
        }
        // broker's own twin is stopped, so nothing is pushed to it
        assert!(h.power.calls().contains(&"stop node-broker".to_string()));
        assert!(h.linux.calls().iter().all(|c| !c.contains("broker->")));
        assert_eq!(h.coordinator.rule("broker", "sensor").unwrap().applied, Some(false));
    }

    #[tokio::test]
    async fn test_backend_failure_is_retried_next_tick() {
        let mut h = harness();
        settle(&mut h).await;

        h.linux.fail_next(1);
        h.coordinator.handle_event(report("sensor", "broker", HealthStatus::Down)).await;
        let rule = h.coordinator.rule("sensor", "broker").unwrap();
        assert_ne!(rule.applied, Some(true));
        assert!(rule.last_error.is_some());

        h.coordinator.tick().await;
        assert_eq!(h.coordinator.rule("sensor", "broker").unwrap().applied, Some(true));
        assert_eq!(h.coordinator.rule("broker", "sensor").unwrap().applied, Some(false));
        assert!(h.coordinator.rule("sensor", "broker").unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_start_is_retried_while_mismatch_persists() {
        let mut h = harness();
        h.power.set_state("node-sensor", "stopped");
        h.power.fail_next(1);
        settle(&mut h).await;

        let starts = |p: &PowerLog| p.calls().iter().filter(|c| *c == "start node-sensor").count();
        assert_eq!(starts(&h.power), 1);
        assert_eq!(h.power.state("node-sensor").as_deref(), Some("stopped"));

        h.coordinator.tick().await;
        assert_eq!(starts(&h.power), 2);
        assert_eq!(h.power.state("node-sensor").as_deref(), Some("started"));

        h.coordinator.tick().await;
        assert_eq!(starts(&h.power), 2, "no further start once the node runs");
    }

    #[tokio::test]
    async fn test_startup_reverifies_leftover_blocks() {
        let mut h = harness();
        h.linux.preload("sensor", "broker");
        settle(&mut h).await;
        assert!(h.linux.blocked().is_empty(), "stale block from a previous run must be lifted");
    }

    #[tokio::test]
    async fn test_status_snapshot_reflects_state() {
        let mut h = harness();
        let status = h.coordinator.status.clone();
        settle(&mut h).await;
        h.coordinator.handle_event(report("router", "sensor", HealthStatus::Down)).await;

        let snap = status.lock().clone();
        assert_eq!(snap.devices["router"].state, SettledState::Up);
        assert_eq!(snap.reports.len(), 1);
        let pair = snap.pairs.iter().find(|p| p.pair == PairKey::new("router", "sensor")).unwrap();
        assert!(pair.blocked);
    }

    #[tokio::test]
    async fn test_links_follow_pair_isolation() {
        let mut h = harness_with_links();
        settle(&mut h).await;
        assert!(h.links.suspended().is_empty());

        // a camera report has no flow to enforce but still cuts the wire
        h.coordinator.handle_event(report("ipcam", "broker", HealthStatus::Down)).await;
        assert_eq!(h.links.suspended(), BTreeSet::from(["l-cb".to_string()]));
        assert!(h.linux.blocked().is_empty());
        h.coordinator.handle_event(report("ipcam", "broker", HealthStatus::Up)).await;
        assert!(h.links.suspended().is_empty());

        h.reach.set(addr("192.168.20.3"), false);
        for _ in 0..3 {
            h.coordinator.tick().await;
        }
        assert_eq!(h.links.suspended(), BTreeSet::from(["l-rs".to_string(), "l-sb".to_string()]));
        let snap = h.coordinator.status.lock().clone();
        let pair = snap.pairs.iter().find(|p| p.pair == PairKey::new("sensor", "broker")).unwrap();
        assert_eq!(pair.links_suspended, Some(true));

        // further ticks keep the links without asking again
        h.coordinator.tick().await;
        let suspends = |l: &LinkLog| l.calls().iter().filter(|c| *c == "suspend l-sb").count();
        assert_eq!(suspends(&h.links), 1);

        h.reach.set(addr("192.168.20.3"), true);
        for _ in 0..3 {
            h.coordinator.tick().await;
        }
        assert!(h.links.suspended().is_empty());
        assert!(h.links.calls().contains(&"resume l-rs".to_string()));
    }

    #[tokio::test]
    async fn test_leftover_suspended_link_is_resumed_at_startup() {
        let mut h = harness_with_links();
        h.links.preload_suspended("l-sb");
        settle(&mut h).await;
        assert!(h.links.suspended().is_empty());
        assert_eq!(h.links.calls().iter().filter(|c| c.starts_with("resume")).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_link_lookup_is_retried_next_tick() {
        let mut h = harness_with_links();
        settle(&mut h).await;

        h.links.fail_next(1);
        h.coordinator.handle_event(report("sensor", "broker", HealthStatus::Down)).await;
        assert!(h.linux.blocked().contains(&("sensor".to_string(), "broker".to_string())));
        assert!(h.links.suspended().is_empty());

        h.coordinator.tick().await;
        assert_eq!(h.links.suspended(), BTreeSet::from(["l-sb".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_inbox_and_closes_backends_on_shutdown() {
        init_test_logging();
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let linux = h.linux.clone();
        let task = tokio::spawn(h.coordinator.run(rx, stop_rx));

        tokio::time::sleep(Duration::from_secs(35)).await;
        tx.send(report("sensor", "broker", HealthStatus::Down)).await.unwrap();
        let blocked = wait_until(Duration::from_secs(1), || {
            linux.blocked().contains(&("sensor".to_string(), "broker".to_string()))
        })
        .await;
        assert!(blocked);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(linux.is_closed());
    }
}
