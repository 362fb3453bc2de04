//! Probe agent loop
//!
//! One fixed-interval loop per physical device. Every tick each peer gets one
//! primary observation, and a fallback confirmation when the primary failed
//! and the peer has one configured. Observations feed a per-peer debounce
//! tracker; only settled transitions leave the agent as health events.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use twin_common::bus::HealthPublisher;
use twin_common::liveness::{LivenessCheck, PeerTarget};
use twin_common::{DebounceTracker, HealthEvent, HealthStatus, SettledState, Thresholds};

struct PeerState {
    target: PeerTarget,
    tracker: DebounceTracker,
}

pub struct ProbeAgent {
    device: String,
    prefix: String,
    peers: Vec<PeerState>,
    primary: Box<dyn LivenessCheck>,
    fallback: Option<Box<dyn LivenessCheck>>,
    check_timeout: Duration,
    fallback_timeout: Duration,
    /// Transitions the bus refused, resent before the next tick's events.
    unsent: Vec<HealthEvent>,
}

impl ProbeAgent {
    pub fn new(
        device: &str,
        prefix: &str,
        targets: Vec<PeerTarget>,
        thresholds: Thresholds,
        primary: Box<dyn LivenessCheck>,
        check_timeout: Duration,
    ) -> Self {
        // peers are assumed reachable until proven otherwise
        let peers = targets
            .into_iter()
            .map(|target| PeerState { target, tracker: DebounceTracker::with_state(thresholds, SettledState::Up) })
            .collect();
        Self {
            device: device.to_string(),
            prefix: prefix.to_string(),
            peers,
            primary,
            fallback: None,
            check_timeout,
            fallback_timeout: check_timeout,
            unsent: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn LivenessCheck>, limit: Duration) -> Self {
        self.fallback = Some(fallback);
        self.fallback_timeout = limit;
        self
    }

    #[cfg(test)]
    pub fn peer_state(&self, peer: &str) -> Option<SettledState> {
        self.peers.iter().find(|p| p.target.name == peer).map(|p| p.tracker.state())
    }

    /// One pass over every peer. Returns the settled transitions as events.
    pub async fn step(&mut self) -> Vec<HealthEvent> {
        self.primary.begin_tick().await;
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.begin_tick().await;
        }

        let mut events = Vec::new();
        for peer in &mut self.peers {
            let ok = observe(
                self.primary.as_mut(),
                self.fallback.as_mut(),
                &peer.target,
                self.check_timeout,
                self.fallback_timeout,
            )
            .await;
            let Some(transition) = peer.tracker.update(ok) else {
                continue;
            };
            let status = HealthStatus::from_ok(transition.to == SettledState::Up);
            info!(device = %self.device, peer = %peer.target.name, %transition, "peer state changed");
            events.push(HealthEvent::new(self.device.clone(), peer.target.name.clone(), status));
        }
        events
    }

    /// Publish `events` after anything left over from earlier ticks, oldest first.
    pub async fn publish(&mut self, publisher: &dyn HealthPublisher, events: Vec<HealthEvent>) {
        self.unsent.extend(events);
        let pending = std::mem::take(&mut self.unsent);
        let mut iter = pending.into_iter();
        while let Some(event) = iter.next() {
            if let Err(e) = publisher.publish_event(&self.prefix, &event).await {
                warn!(device = %self.device, topic = %event.topic(&self.prefix), error = %e, "publish failed, keeping event for the next tick");
                self.unsent.push(event);
                self.unsent.extend(iter);
                return;
            }
            debug!(topic = %event.topic(&self.prefix), status = %event.status.as_str(), "health event published");
        }
    }

    pub fn unsent(&self) -> usize {
        self.unsent.len()
    }

    /// Tick until `shutdown` flips, then release the checks' sessions.
    pub async fn run(&mut self, publisher: &dyn HealthPublisher, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(device = %self.device, peers = self.peers.len(), check = self.primary.kind(), "probe loop started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let events = self.step().await;
                    self.publish(publisher, events).await;
                }
            }
        }
        self.close().await;
        info!(device = %self.device, "probe loop stopped");
    }

    pub async fn close(&mut self) {
        self.primary.close().await;
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.close().await;
        }
    }
}

/// One observation of `target`. Errors and timeouts count as failures.
async fn observe(
    primary: &mut dyn LivenessCheck,
    fallback: Option<&mut Box<dyn LivenessCheck>>,
    target: &PeerTarget,
    check_timeout: Duration,
    fallback_timeout: Duration,
) -> bool {
    if bounded(primary, target, check_timeout).await {
        return true;
    }
    match fallback {
        Some(fallback) if target.fallback.is_some() => {
            let alive = bounded(fallback.as_mut(), target, fallback_timeout).await;
            if alive {
                debug!(peer = %target.name, "primary check failed, fallback confirmed alive");
            }
            alive
        }
        _ => false,
    }
}

async fn bounded(check: &mut dyn LivenessCheck, target: &PeerTarget, limit: Duration) -> bool {
    let kind = check.kind();
    match timeout(limit, check.check(target)).await {
        Ok(Ok(alive)) => alive,
        Ok(Err(e)) => {
            debug!(peer = %target.name, check = kind, class = e.class(), error = %e, "check failed");
            false
        }
        Err(_) => {
            debug!(peer = %target.name, check = kind, limit_ms = limit.as_millis() as u64, "check timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{check_limit, RouterCliPing};
    use twin_common::backoff::ReconnectPolicy;
    use twin_common::cli::IosSettings;
    use twin_common::config::RouterConf;
    use twin_common::liveness::Fallback;
    use twin_common::ssh::SshEndpoint;
    use twin_devkit::ios_sim::{AttemptLog, UnresponsiveRouter};
    use twin_devkit::test_utils::{CheckScript, ScriptedCheck};
    use twin_devkit::{init_test_logging, MockBus};

    fn targets() -> Vec<PeerTarget> {
        vec![
            PeerTarget { name: "broker".into(), address: "192.168.20.2".parse().unwrap(), fallback: None },
            PeerTarget {
                name: "router".into(),
                address: "192.168.20.1".parse().unwrap(),
                fallback: Some(Fallback::RecentMessage { topic: "sensors/physical/data".into() }),
            },
        ]
    }

    fn agent() -> (ProbeAgent, CheckScript) {
        let (check, script) = ScriptedCheck::new("ping");
        let agent = ProbeAgent::new("sensor", "health", targets(), Thresholds::new(3, 3), Box::new(check), Duration::from_secs(3));
        (agent, script)
    }

    #[tokio::test]
    async fn test_three_failures_emit_one_down_on_the_third() {
        let (mut agent, script) = agent();
        script.set("broker", false);

        assert!(agent.step().await.is_empty());
        assert!(agent.step().await.is_empty());
        let events = agent.step().await;
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].source.as_str(), events[0].target.as_str()), ("sensor", "broker"));
        assert_eq!(events[0].status, HealthStatus::Down);
        assert!(agent.step().await.is_empty(), "a settled state does not fire again");

        script.set("broker", true);
        assert!(agent.step().await.is_empty());
        assert!(agent.step().await.is_empty());
        let events = agent.step().await;
        assert_eq!(events[0].status, HealthStatus::Up);
        assert_eq!(script.ticks(), 7);
    }

    #[tokio::test]
    async fn test_errors_count_as_failures_and_interrupted_runs_reset() {
        let (mut agent, script) = agent();
        script.push_error("broker");
        script.push_error("broker");
        script.push("broker", true);
        script.set("broker", false);

        for _ in 0..5 {
            assert!(agent.step().await.is_empty());
        }
        assert_eq!(agent.step().await.len(), 1);
        assert_eq!(agent.peer_state("broker"), Some(SettledState::Down));
    }

    #[tokio::test]
    async fn test_fallback_confirms_only_peers_that_have_one() {
        let (check, script) = ScriptedCheck::new("ping");
        let (fallback, fallback_script) = ScriptedCheck::new("fallback");
        let mut agent = ProbeAgent::new("sensor", "health", targets(), Thresholds::new(1, 1), Box::new(check), Duration::from_secs(3))
            .with_fallback(Box::new(fallback), Duration::from_secs(3));
        script.set("broker", false);
        script.set("router", false);

        let events = agent.step().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, "broker");
        assert_eq!(agent.peer_state("router"), Some(SettledState::Up));
        assert_eq!(fallback_script.calls(), vec!["router"]);

        fallback_script.set("router", false);
        let events = agent.step().await;
        assert_eq!(events[0].target, "router");
        assert_eq!(events[0].status, HealthStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_check_times_out_as_failure() {
        let (mut agent, script) = agent();
        script.stall(Some(Duration::from_secs(60)));
        for _ in 0..2 {
            assert!(agent.step().await.is_empty());
        }
        let events = agent.step().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.status == HealthStatus::Down));
    }

    fn router_agent(limit: Duration) -> (ProbeAgent, AttemptLog, ReconnectPolicy) {
        let conf = RouterConf::default();
        let policy = conf.reconnect.policy();
        let (connector, attempts) = UnresponsiveRouter::new(policy, Duration::from_secs(10));
        let endpoint = SshEndpoint {
            host: "192.168.20.1".parse().unwrap(),
            port: 22,
            bind: Some("192.168.20.250".parse().unwrap()),
            user: "admin".into(),
            password: "cisco".into(),
        };
        let check = RouterCliPing::new(connector, endpoint, IosSettings::default(), &conf);
        let targets = vec![
            PeerTarget { name: "sensor".into(), address: "192.168.20.3".parse().unwrap(), fallback: None },
            PeerTarget { name: "ipcam".into(), address: "192.168.20.4".parse().unwrap(), fallback: None },
            PeerTarget { name: "broker".into(), address: "192.168.20.2".parse().unwrap(), fallback: None },
        ];
        let agent = ProbeAgent::new("router", "health", targets, Thresholds::new(1, 1), Box::new(check), limit);
        (agent, attempts, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_black_holed_router_backs_off_once_per_tick() {
        init_test_logging();
        let connect = Duration::from_secs(10);
        let (mut agent, attempts, policy) = router_agent(check_limit(&RouterConf::default(), connect));

        let events = agent.step().await;
        assert_eq!(events.len(), 3, "every peer fails while the router is unreachable");
        assert!(events.iter().all(|e| e.status == HealthStatus::Down));
        assert_eq!(attempts.count(), policy.max_attempts as usize);

        // strictly increasing, capped sleeps between the hanging attempts
        let times = attempts.times();
        let sleeps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0] - connect).collect();
        for pair in sleeps.windows(2) {
            assert!(pair[1] > pair[0], "backoff must grow: {sleeps:?}");
        }
        assert!(sleeps.iter().all(|d| *d <= policy.max));

        // the next tick starts one fresh run
        agent.step().await;
        assert_eq!(attempts.count(), 2 * policy.max_attempts as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cut_short_by_check_timeout_still_ends_the_tick() {
        let limit = Duration::from_secs(24);
        let (mut agent, attempts, policy) = router_agent(limit);
        let start = tokio::time::Instant::now();

        let events = agent.step().await;
        assert_eq!(events.len(), 3);
        assert!(attempts.count() <= policy.max_attempts as usize);
        // only the first peer's check dialled; the others gave up immediately
        assert!(attempts.times().iter().all(|t| *t - start < limit));
        assert!(start.elapsed() < limit + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_refused_events_are_resent_in_order() {
        let (mut agent, _script) = agent();
        let bus = MockBus::new();
        bus.set_failing(true);
        let down = HealthEvent::new("sensor", "broker", HealthStatus::Down);
        let up = HealthEvent::new("sensor", "broker", HealthStatus::Up);

        agent.publish(&bus, vec![down.clone()]).await;
        agent.publish(&bus, vec![up.clone()]).await;
        assert_eq!(agent.unsent(), 2);

        bus.set_failing(false);
        agent.publish(&bus, Vec::new()).await;
        assert_eq!(agent.unsent(), 0);
        assert_eq!(bus.health_events("health"), vec![down, up]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_transitions_and_closes_checks_on_shutdown() {
        let (check, script) = ScriptedCheck::new("ping");
        script.set("broker", false);
        let mut agent = ProbeAgent::new("sensor", "health", targets(), Thresholds::new(3, 3), Box::new(check), Duration::from_secs(3));
        let bus = MockBus::new();
        let (tx, rx) = watch::channel(false);

        let publisher = bus.clone();
        let task = tokio::spawn(async move {
            agent.run(&publisher, Duration::from_secs(10), rx).await;
        });
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let published = bus.find_messages_by_topic("health/sensor/broker");
        assert_eq!(published.len(), 1);
        assert!(script.is_closed());
    }
}
