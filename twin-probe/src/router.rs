//! Liveness as seen from the router itself
//!
//! Keeps one CLI session open on the physical router and pings each peer from
//! the router's own exec prompt. A lost session is reopened (the connector
//! applies the capped backoff); when that fails too, or the caller's timeout
//! cuts the reopen short, every remaining peer of the tick is reported failed
//! without further connection attempts.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};
use twin_common::cli::{IosCli, IosSettings};
use twin_common::config::RouterConf;
use twin_common::error::{SyncError, TransportError};
use twin_common::liveness::{LivenessCheck, PeerTarget};
use twin_common::remote::CliConnector;
use twin_common::ssh::SshEndpoint;

/// Time one router check may take: a full reconnect run where each attempt
/// waits out `connect`, then one ping.
pub fn check_limit(conf: &RouterConf, connect: Duration) -> Duration {
    conf.reconnect.policy().worst_case(connect) + conf.ping_deadline()
}

pub struct RouterCliPing<K> {
    connector: K,
    endpoint: SshEndpoint,
    settings: IosSettings,
    repeat: u32,
    timeout_secs: u64,
    deadline: Duration,
    cli: Option<IosCli>,
    gave_up: bool,
}

impl<K: CliConnector> RouterCliPing<K> {
    pub fn new(connector: K, endpoint: SshEndpoint, settings: IosSettings, conf: &RouterConf) -> Self {
        Self {
            connector,
            endpoint,
            settings,
            repeat: conf.ping_repeat.max(1),
            timeout_secs: conf.ping_timeout_seconds,
            deadline: conf.ping_deadline(),
            cli: None,
            gave_up: false,
        }
    }

    async fn connect(&mut self) -> Result<IosCli, SyncError> {
        let chan = self.connector.open(&self.endpoint).await?;
        let cli = IosCli::attach(chan, self.settings.clone()).await?;
        info!(router = %self.endpoint, mode = ?cli.mode(), "router cli session ready");
        Ok(cli)
    }

    async fn session(&mut self) -> Result<&mut IosCli, SyncError> {
        if self.gave_up {
            return Err(TransportError::Closed { host: self.endpoint.host.to_string() }.into());
        }
        if self.cli.is_none() {
            // set before the attempt so a reopen cancelled by the check
            // timeout still counts as this tick's one reconnect run
            self.gave_up = true;
            match self.connect().await {
                Ok(cli) => {
                    self.gave_up = false;
                    self.cli = Some(cli);
                }
                Err(e) => {
                    warn!(router = %self.endpoint, class = e.class(), error = %e, "router unreachable, skipping the rest of this tick");
                    return Err(e);
                }
            }
        }
        self.cli
            .as_mut()
            .ok_or_else(|| TransportError::Closed { host: self.endpoint.host.to_string() }.into())
    }

    async fn drop_session(&mut self) {
        if let Some(mut cli) = self.cli.take() {
            cli.close().await;
        }
    }

    async fn ping_once(&mut self, peer: &PeerTarget) -> Result<bool, SyncError> {
        let (repeat, timeout_secs, deadline) = (self.repeat, self.timeout_secs, self.deadline);
        let cli = self.session().await?;
        match cli.ping(peer.address, repeat, timeout_secs, deadline).await {
            Ok((ok, output)) => {
                debug!(router = %self.endpoint, peer = %peer.name, ok, output = %output.trim(), "cli ping");
                Ok(ok)
            }
            Err(e) => {
                self.drop_session().await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<K: CliConnector> LivenessCheck for RouterCliPing<K> {
    fn kind(&self) -> &'static str {
        "router-cli-ping"
    }

    async fn begin_tick(&mut self) {
        self.gave_up = false;
    }

    async fn check(&mut self, peer: &PeerTarget) -> Result<bool, SyncError> {
        match self.ping_once(peer).await {
            Err(SyncError::Transient(e)) if !self.gave_up => {
                warn!(router = %self.endpoint, peer = %peer.name, error = %e, "router session lost, reopening");
                self.ping_once(peer).await
            }
            other => other,
        }
    }

    async fn close(&mut self) {
        self.drop_session().await;
        self.connector.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_common::cli::ReadWindow;
    use twin_devkit::ios_sim::{IosSimConnector, ScriptedIosDevice};

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            host: "192.168.20.1".parse().unwrap(),
            port: 22,
            bind: Some("192.168.20.250".parse().unwrap()),
            user: "admin".into(),
            password: "cisco".into(),
        }
    }

    fn probe(device: &ScriptedIosDevice) -> RouterCliPing<IosSimConnector> {
        let settings = IosSettings {
            window: ReadWindow::new(Duration::from_millis(200), Duration::from_secs(5)),
            ..IosSettings::default()
        };
        RouterCliPing::new(device.connector(), endpoint(), settings, &RouterConf::default())
    }

    fn peer(name: &str, addr: &str) -> PeerTarget {
        PeerTarget { name: name.into(), address: addr.parse().unwrap(), fallback: None }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_from_router_and_reuses_session() {
        let device = ScriptedIosDevice::new("R1", "class");
        device.set_reachable("192.168.20.4", false);
        let mut check = probe(&device);

        check.begin_tick().await;
        assert!(check.check(&peer("sensor", "192.168.20.3")).await.unwrap());
        assert!(!check.check(&peer("ipcam", "192.168.20.4")).await.unwrap());
        check.begin_tick().await;
        assert!(check.check(&peer("sensor", "192.168.20.3")).await.unwrap());

        assert_eq!(device.opens(), 1);
        assert_eq!(device.pings(), vec!["192.168.20.3", "192.168.20.4", "192.168.20.3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_reopened_within_the_tick() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut check = probe(&device);
        check.begin_tick().await;
        assert!(check.check(&peer("sensor", "192.168.20.3")).await.unwrap());

        device.drop_sessions();
        assert!(check.check(&peer("sensor", "192.168.20.3")).await.unwrap());
        assert_eq!(device.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cut_off_ping_fails_and_drops_the_session() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut check = probe(&device);
        check.begin_tick().await;

        device.stall_pings(true);
        let err = check.check(&peer("sensor", "192.168.20.3")).await.unwrap_err();
        assert_eq!(err.class(), "protocol_parse");
        assert!(err.transcript().unwrap().contains("Type escape sequence"));
        assert!(check.cli.is_none(), "a half-read session must not be reused");

        // the next peer is judged on a fresh session, not on leftover output
        device.stall_pings(false);
        device.set_reachable("192.168.20.4", false);
        assert!(!check.check(&peer("ipcam", "192.168.20.4")).await.unwrap());
        assert_eq!(device.opens(), 2);
    }

    #[test]
    fn test_check_limit_covers_a_full_reconnect_run() {
        let conf = RouterConf::default();
        let limit = check_limit(&conf, Duration::from_secs(10));
        assert_eq!(limit, Duration::from_secs(65) + conf.ping_deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_router_gives_up_until_next_tick() {
        let device = ScriptedIosDevice::new("R1", "class");
        device.fail_next_opens(1);
        let mut check = probe(&device);

        check.begin_tick().await;
        let err = check.check(&peer("sensor", "192.168.20.3")).await.unwrap_err();
        assert_eq!(err.class(), "transient_network");
        assert!(check.check(&peer("ipcam", "192.168.20.4")).await.is_err());
        assert_eq!(device.opens(), 0);
        assert!(check.cli.is_none());

        check.begin_tick().await;
        assert!(check.check(&peer("sensor", "192.168.20.3")).await.unwrap());
        assert_eq!(device.opens(), 1);
    }
}
