//! IOS route backend
//!
//! Isolates a digital router from one peer by installing a host discard route
//! (`Null0`). Every change is bracketed by a verification so the log line
//! carries what the router showed before and after.

use async_trait::async_trait;
use tracing::debug;
use twin_common::cli::ios::{discard_route, remove_discard_route, IosCli, IosSettings, RouteCheck};
use twin_common::enforcement::{BackendKind, EnforcementBackend, EnforcementTarget, Outcome};
use twin_common::error::SyncError;
use twin_common::remote::CliConnector;

pub struct IosRouteBackend<K> {
    connector: K,
    settings: IosSettings,
    persist: bool,
}

impl<K: CliConnector> IosRouteBackend<K> {
    pub fn new(connector: K, settings: IosSettings, persist: bool) -> Self {
        Self { connector, settings, persist }
    }

    async fn attach(&mut self, target: &EnforcementTarget) -> Result<IosCli, SyncError> {
        let chan = self.connector.open(&target.endpoint).await?;
        let settings = IosSettings { enable_secret: target.secret.clone(), ..self.settings.clone() };
        Ok(IosCli::attach(chan, settings).await?)
    }

    async fn converge(&mut self, cli: &mut IosCli, target: &EnforcementTarget, block: bool) -> Result<Outcome, SyncError> {
        let before = cli.verify(target.peer_address).await?;
        if before.present == block {
            return Ok(Outcome::unchanged(render(&before)));
        }

        let line = if block { discard_route(target.peer_address) } else { remove_discard_route(target.peer_address) };
        let transcript = cli.apply(&[line], self.persist).await?;
        debug!(host = %target.endpoint.host, transcript = %transcript, "route change applied");

        let after = cli.verify(target.peer_address).await?;
        if after.present != block {
            return Err(SyncError::VerificationMismatch {
                host: target.endpoint.host.to_string(),
                peer: target.peer.clone(),
                expected: block,
                before: render(&before),
                after: render(&after),
            });
        }
        Ok(Outcome { changed: true, before: render(&before), after: render(&after) })
    }

    async fn run(&mut self, target: &EnforcementTarget, block: bool) -> Result<Outcome, SyncError> {
        let mut cli = self.attach(target).await?;
        let result = self.converge(&mut cli, target, block).await;
        cli.close().await;
        result
    }
}

fn render(check: &RouteCheck) -> String {
    format!(
        "running-config: {} | rib: {}",
        check.running_config_text.trim(),
        check.rib_text.trim()
    )
}

#[async_trait]
impl<K: CliConnector> EnforcementBackend for IosRouteBackend<K> {
    fn kind(&self) -> BackendKind {
        BackendKind::IosRoute
    }

    async fn is_blocked(&mut self, target: &EnforcementTarget) -> Result<bool, SyncError> {
        let mut cli = self.attach(target).await?;
        let check = cli.verify(target.peer_address).await;
        cli.close().await;
        Ok(check?.present)
    }

    async fn block(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        self.run(target, true).await
    }

    async fn unblock(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        self.run(target, false).await
    }

    async fn close(&mut self) {
        self.connector.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use twin_common::cli::ReadWindow;
    use twin_common::ssh::SshEndpoint;
    use twin_devkit::ios_sim::ScriptedIosDevice;

    fn target() -> EnforcementTarget {
        EnforcementTarget {
            enforcer: "router".into(),
            peer: "sensor".into(),
            peer_address: "10.10.0.3".parse().unwrap(),
            endpoint: SshEndpoint {
                host: "10.10.0.1".parse().unwrap(),
                port: 22,
                bind: None,
                user: "admin".into(),
                password: "cisco".into(),
            },
            secret: "class".into(),
        }
    }

    fn settings() -> IosSettings {
        IosSettings {
            enable_secret: String::new(),
            privilege_attempts: 2,
            command_delay: Duration::from_millis(50),
            window: ReadWindow::new(Duration::from_millis(200), Duration::from_secs(5)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_then_verify_present_and_idempotent() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut backend = IosRouteBackend::new(device.connector(), settings(), false);

        let outcome = backend.block(&target()).await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.after.contains("ip route 10.10.0.3 255.255.255.255 Null0"));
        assert!(device.has_route("10.10.0.3"));
        assert!(backend.is_blocked(&target()).await.unwrap());

        let again = backend.block(&target()).await.unwrap();
        assert!(!again.changed);
        assert_eq!(device.config_commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unblock_removes_route_and_is_noop_when_absent() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut backend = IosRouteBackend::new(device.connector(), settings(), false);

        let noop = backend.unblock(&target()).await.unwrap();
        assert!(!noop.changed);
        assert!(device.config_commands().is_empty());

        backend.block(&target()).await.unwrap();
        let outcome = backend.unblock(&target()).await.unwrap();
        assert!(outcome.changed);
        assert!(!device.has_route("10.10.0.3"));
        assert!(!backend.is_blocked(&target()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_is_protocol_parse_with_transcript() {
        let device = ScriptedIosDevice::new("R1", "class");
        device.reject_commands_containing("ip route");
        let mut backend = IosRouteBackend::new(device.connector(), settings(), false);

        let err = backend.block(&target()).await.unwrap_err();
        assert_eq!(err.class(), "protocol_parse");
        assert!(err.transcript().unwrap().contains("Invalid input detected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_that_does_not_stick_is_a_mismatch() {
        let device = ScriptedIosDevice::new("R1", "class");
        device.ignore_route_changes();
        let mut backend = IosRouteBackend::new(device.connector(), settings(), false);

        let err = backend.block(&target()).await.unwrap_err();
        assert_eq!(err.class(), "verification_mismatch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_writes_memory() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut backend = IosRouteBackend::new(device.connector(), settings(), true);
        backend.block(&target()).await.unwrap();
        assert_eq!(device.saves(), 1);
    }
}
