// No-op backends for --dry-run: decisions are logged, nothing is touched

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::info;
use twin_common::enforcement::{
    BackendKind, EnforcementBackend, EnforcementTarget, LinkBackend, LinkInfo, NodeState, Outcome, PowerBackend,
};
use twin_common::error::SyncError;

pub struct DryRunEnforcer {
    kind: BackendKind,
    blocked: HashSet<(String, String)>,
}

impl DryRunEnforcer {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind, blocked: HashSet::new() }
    }

    fn key(target: &EnforcementTarget) -> (String, String) {
        (target.enforcer.clone(), target.peer.clone())
    }
}

#[async_trait]
impl EnforcementBackend for DryRunEnforcer {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn is_blocked(&mut self, target: &EnforcementTarget) -> Result<bool, SyncError> {
        Ok(self.blocked.contains(&Self::key(target)))
    }

    async fn block(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        let changed = self.blocked.insert(Self::key(target));
        info!(backend = %self.kind, enforcer = %target.enforcer, peer = %target.peer, "[dry-run] block");
        Ok(Outcome { changed, before: "dry-run".into(), after: "dry-run".into() })
    }

    async fn unblock(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        let changed = self.blocked.remove(&Self::key(target));
        info!(backend = %self.kind, enforcer = %target.enforcer, peer = %target.peer, "[dry-run] unblock");
        Ok(Outcome { changed, before: "dry-run".into(), after: "dry-run".into() })
    }

    async fn close(&mut self) {}
}

#[derive(Default)]
pub struct DryRunPower {
    states: HashMap<String, String>,
}

#[async_trait]
impl PowerBackend for DryRunPower {
    async fn start(&mut self, node: &str) -> Result<(), SyncError> {
        info!(node, "[dry-run] start node");
        self.states.insert(node.to_string(), "started".into());
        Ok(())
    }

    async fn stop(&mut self, node: &str) -> Result<(), SyncError> {
        info!(node, "[dry-run] stop node");
        self.states.insert(node.to_string(), "stopped".into());
        Ok(())
    }

    async fn get_state(&mut self, node: &str) -> Result<NodeState, SyncError> {
        let status = self.states.get(node).cloned().unwrap_or_else(|| "unknown".into());
        Ok(NodeState { node: node.to_string(), status })
    }
}

/// Finds no links, so nothing is ever suspended.
pub struct DryRunLinks;

#[async_trait]
impl LinkBackend for DryRunLinks {
    async fn links_between(&mut self, a: &str, b: &str) -> Result<Vec<LinkInfo>, SyncError> {
        info!(a, b, "[dry-run] look up links");
        Ok(Vec::new())
    }

    async fn set_suspended(&mut self, link: &str, suspend: bool) -> Result<(), SyncError> {
        info!(link, suspend, "[dry-run] set link suspension");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_common::ssh::SshEndpoint;

    fn target() -> EnforcementTarget {
        EnforcementTarget {
            enforcer: "sensor".into(),
            peer: "broker".into(),
            peer_address: "10.10.0.2".parse().unwrap(),
            endpoint: SshEndpoint {
                host: "10.10.0.3".parse().unwrap(),
                port: 22,
                bind: None,
                user: "pi".into(),
                password: "raspberry".into(),
            },
            secret: "raspberry".into(),
        }
    }

    #[tokio::test]
    async fn test_dry_run_enforcer_tracks_intent_only() {
        let mut enforcer = DryRunEnforcer::new(BackendKind::LinuxFirewall);
        let t = target();
        assert!(enforcer.block(&t).await.unwrap().changed);
        assert!(!enforcer.block(&t).await.unwrap().changed);
        assert!(enforcer.is_blocked(&t).await.unwrap());
        assert!(enforcer.unblock(&t).await.unwrap().changed);
        assert!(!enforcer.is_blocked(&t).await.unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_links_find_nothing_to_suspend() {
        let mut links = DryRunLinks;
        assert!(links.links_between("node-sensor", "node-broker").await.unwrap().is_empty());
        links.set_suspended("l-1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_power_reports_last_request() {
        let mut power = DryRunPower::default();
        assert_eq!(power.get_state("node-sensor").await.unwrap().status, "unknown");
        power.stop("node-sensor").await.unwrap();
        assert!(!power.get_state("node-sensor").await.unwrap().is_running());
        power.start("node-sensor").await.unwrap();
        assert!(power.get_state("node-sensor").await.unwrap().is_running());
    }
}
