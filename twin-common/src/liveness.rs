//! Liveness checks run by probe agents

use crate::config::{PeerConf, Topology};
use crate::error::SyncError;
use async_trait::async_trait;
use std::net::IpAddr;

/// Protocol-specific confirmation tried once after a failed primary check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Any message on `topic` within the fallback window counts as alive.
    RecentMessage { topic: String },
    /// An RTSP server answering `OPTIONS` on `url` counts as alive.
    Rtsp { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub name: String,
    /// Physical address of the peer.
    pub address: IpAddr,
    pub fallback: Option<Fallback>,
}

impl PeerTarget {
    /// Resolve a device's configured peers against the topology.
    pub fn for_device(topology: &Topology, device: &str) -> Vec<PeerTarget> {
        let Some(dev) = topology.device(device) else {
            return Vec::new();
        };
        dev.peers
            .iter()
            .filter_map(|peer| {
                let target = topology.device(peer.name())?;
                let fallback = match peer {
                    PeerConf::Name(_) => None,
                    PeerConf::Detailed(d) => d
                        .fallback_topic
                        .clone()
                        .map(|topic| Fallback::RecentMessage { topic })
                        .or_else(|| d.rtsp_url.clone().map(|url| Fallback::Rtsp { url })),
                };
                Some(PeerTarget { name: target.name.clone(), address: target.physical, fallback })
            })
            .collect()
    }
}

#[async_trait]
pub trait LivenessCheck: Send {
    fn kind(&self) -> &'static str;

    /// Called once per tick before the first peer is checked.
    async fn begin_tick(&mut self) {}

    /// One observation. Errors count as a failed observation.
    async fn check(&mut self, peer: &PeerTarget) -> Result<bool, SyncError>;

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_targets_resolve_physical_addresses_and_fallbacks() {
        let topo = Topology::from_yaml(
            r#"
devices:
  sensor:
    type: sensor
    physical: 192.168.20.3
    digital: 10.10.0.3
    peers:
      - broker
      - name: ipcam
        rtsp_url: rtsp://192.168.20.4/stream1
  broker: { type: broker, physical: 192.168.20.2, digital: 10.10.0.2 }
  ipcam: { type: camera, physical: 192.168.20.4, digital: 10.10.0.4 }
"#,
        )
        .unwrap();
        let targets = PeerTarget::for_device(&topo, "sensor");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].address, "192.168.20.2".parse::<IpAddr>().unwrap());
        assert_eq!(targets[0].fallback, None);
        assert_eq!(targets[1].fallback, Some(Fallback::Rtsp { url: "rtsp://192.168.20.4/stream1".into() }));
        assert!(PeerTarget::for_device(&topo, "nobody").is_empty());
    }
}
