//! Backend seams driven by the coordinator
//!
//! Enforcement backends isolate one digital device from one peer; the power
//! backend starts and stops digital nodes; the link backend suspends the
//! emulated wires between nodes. All are idempotent: blocking an already
//! blocked flow or stopping a stopped node succeeds without change.

use crate::config::DeviceType;
use crate::error::SyncError;
use crate::ssh::SshEndpoint;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LinuxFirewall,
    IosRoute,
}

impl BackendKind {
    /// Which backend isolates traffic originating on a device of this type.
    pub fn for_device(kind: DeviceType) -> Option<Self> {
        match kind {
            DeviceType::Sensor | DeviceType::Broker => Some(BackendKind::LinuxFirewall),
            DeviceType::Router => Some(BackendKind::IosRoute),
            DeviceType::Camera => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::LinuxFirewall => "linux_firewall",
            BackendKind::IosRoute => "ios_route",
        })
    }
}

/// Block traffic from `enforcer`'s digital twin towards `peer_address`.
#[derive(Debug, Clone)]
pub struct EnforcementTarget {
    pub enforcer: String,
    pub peer: String,
    pub peer_address: IpAddr,
    /// Management login on the enforcer's digital twin.
    pub endpoint: SshEndpoint,
    /// Privilege-elevation secret (IOS) or sudo password (Linux).
    pub secret: String,
}

/// Result of a block or unblock, with the verification text seen on either side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// False when the desired state was already in place.
    pub changed: bool,
    pub before: String,
    pub after: String,
}

impl Outcome {
    pub fn unchanged(state: impl Into<String>) -> Self {
        let state = state.into();
        Self { changed: false, before: state.clone(), after: state }
    }
}

#[async_trait]
pub trait EnforcementBackend: Send {
    fn kind(&self) -> BackendKind;

    async fn is_blocked(&mut self, target: &EnforcementTarget) -> Result<bool, SyncError>;

    async fn block(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError>;

    async fn unblock(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError>;

    /// Release every session the backend holds.
    async fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeState {
    pub node: String,
    pub status: String,
}

impl NodeState {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("started")
    }
}

#[async_trait]
pub trait PowerBackend: Send {
    async fn start(&mut self, node: &str) -> Result<(), SyncError>;

    async fn stop(&mut self, node: &str) -> Result<(), SyncError>;

    async fn get_state(&mut self, node: &str) -> Result<NodeState, SyncError>;
}

/// One emulated wire in the orchestrator's project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub id: String,
    pub suspended: bool,
}

#[async_trait]
pub trait LinkBackend: Send {
    /// Every link with both nodes among its endpoints.
    async fn links_between(&mut self, a: &str, b: &str) -> Result<Vec<LinkInfo>, SyncError>;

    async fn set_suspended(&mut self, link: &str, suspend: bool) -> Result<(), SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection_by_source_type() {
        assert_eq!(BackendKind::for_device(DeviceType::Sensor), Some(BackendKind::LinuxFirewall));
        assert_eq!(BackendKind::for_device(DeviceType::Broker), Some(BackendKind::LinuxFirewall));
        assert_eq!(BackendKind::for_device(DeviceType::Router), Some(BackendKind::IosRoute));
        assert_eq!(BackendKind::for_device(DeviceType::Camera), None);
    }

    #[test]
    fn test_node_state_running() {
        let st = NodeState { node: "n1".into(), status: "started".into() };
        assert!(st.is_running());
        assert!(!NodeState { node: "n1".into(), status: "stopped".into() }.is_running());
    }
}
