//! Static topology configuration (devices.yaml)
//!
//! Loaded once at startup and immutable afterwards. Every numeric knob has a
//! default so a minimal file only lists devices.

use crate::backoff::ReconnectPolicy;
use crate::debounce::Thresholds;
use crate::error::ConfigError;
use crate::models::PairKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "devices.yaml";
pub const CONFIG_ENV_VAR: &str = "TWIN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub monitor: MonitorConf,
    #[serde(default)]
    pub mqtt: MqttConf,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConf>,
    #[serde(default)]
    pub router: RouterConf,
    #[serde(default)]
    pub ssh: SshConf,
    pub devices: BTreeMap<String, DeviceConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConf {
    pub check_interval_seconds: u64,
    pub device_fail_threshold: u32,
    pub device_recover_threshold: u32,
    pub connection_fail_threshold: u32,
    pub connection_recover_threshold: u32,
    pub probe_interval_seconds: u64,
    pub probe_fail_threshold: u32,
    pub probe_recover_threshold: u32,
    pub ping_count: u32,
    pub ping_timeout_seconds: u64,
    pub fallback_timeout_seconds: u64,
    pub mqtt_prefix: String,
    pub iptables_chain: String,
    pub event_queue_depth: usize,
    /// Address of the read-only status endpoint; disabled when absent.
    pub status_listen: Option<SocketAddr>,
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            check_interval_seconds: 10,
            device_fail_threshold: 3,
            device_recover_threshold: 3,
            connection_fail_threshold: 1,
            connection_recover_threshold: 1,
            probe_interval_seconds: 10,
            probe_fail_threshold: 3,
            probe_recover_threshold: 3,
            ping_count: 1,
            ping_timeout_seconds: 2,
            fallback_timeout_seconds: 3,
            mqtt_prefix: "health".into(),
            iptables_chain: "OUTPUT".into(),
            event_queue_depth: 64,
            status_listen: None,
        }
    }
}

impl MonitorConf {
    pub fn device_thresholds(&self) -> Thresholds {
        Thresholds::new(self.device_fail_threshold, self.device_recover_threshold)
    }

    pub fn connection_thresholds(&self) -> Thresholds {
        Thresholds::new(self.connection_fail_threshold, self.connection_recover_threshold)
    }

    pub fn probe_thresholds(&self) -> Thresholds {
        Thresholds::new(self.probe_fail_threshold, self.probe_recover_threshold)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    /// Upper bound for one ping: every echo may wait the full timeout.
    pub fn ping_deadline(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_seconds * u64::from(self.ping_count.max(1)) + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    /// Broker host; falls back to the physical address of the broker device.
    pub host: Option<String>,
    pub port: u16,
    pub client_id: Option<String>,
    pub keepalive_seconds: u64,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: None,
            port: 1883,
            client_id: None,
            keepalive_seconds: 60,
            user: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConf {
    pub url: String,
    pub project_id: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_orchestrator_timeout")]
    pub timeout_seconds: u64,
    /// Also suspend the links between isolated nodes, on top of the rules
    /// pushed to the twins themselves.
    #[serde(default)]
    pub suspend_links: bool,
}

fn default_orchestrator_timeout() -> u64 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConf {
    pub ping_repeat: u32,
    pub ping_timeout_seconds: u64,
    pub keepalive_seconds: u64,
    /// Issue `write memory` after route changes.
    pub persist_config: bool,
    pub privilege_attempts: u32,
    pub reconnect: ReconnectConf,
}

impl Default for RouterConf {
    fn default() -> Self {
        Self {
            ping_repeat: 3,
            ping_timeout_seconds: 2,
            keepalive_seconds: 10,
            persist_config: false,
            privilege_attempts: 3,
            reconnect: ReconnectConf::default(),
        }
    }
}

impl RouterConf {
    /// Deadline for one CLI ping: every echo may time out, plus slack for the summary.
    pub fn ping_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.ping_repeat) * (self.ping_timeout_seconds + 1) + 5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConf {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { initial_delay_ms: 1000, max_delay_ms: 10_000, max_attempts: 5 }
    }
}

impl ReconnectConf {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConf {
    pub port: u16,
    pub connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
}

impl Default for SshConf {
    fn default() -> Self {
        Self { port: 22, connect_timeout_seconds: 10, command_timeout_seconds: 20 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Broker,
    Sensor,
    Camera,
    Router,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Broker => "broker",
            DeviceType::Sensor => "sensor",
            DeviceType::Camera => "camera",
            DeviceType::Router => "router",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    /// Privilege-elevation secret (routers); defaults to the login password.
    #[serde(default)]
    pub enable_password: Option<String>,
}

impl Credentials {
    pub fn enable_secret(&self) -> &str {
        self.enable_password.as_deref().unwrap_or(&self.password)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("user", &self.user).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerConf {
    Name(String),
    Detailed(PeerDetail),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDetail {
    pub name: String,
    /// Topic whose recent traffic confirms the peer when a ping fails.
    #[serde(default)]
    pub fallback_topic: Option<String>,
    /// RTSP stream whose answer confirms the peer when a ping fails.
    #[serde(default)]
    pub rtsp_url: Option<String>,
}

impl PeerConf {
    pub fn name(&self) -> &str {
        match self {
            PeerConf::Name(n) => n,
            PeerConf::Detailed(d) => &d.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConf {
    /// Filled from the map key after loading.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceType,
    pub physical: IpAddr,
    pub digital: IpAddr,
    /// Local source address used to reach the physical device.
    #[serde(default)]
    pub bind: Option<IpAddr>,
    /// Local source address used to reach the digital twin.
    #[serde(default)]
    pub digital_bind: Option<IpAddr>,
    /// Login on the digital twin (used by the enforcement backends).
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Login on the physical device when it differs from the twin's.
    #[serde(default)]
    pub physical_credentials: Option<Credentials>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConf>,
}

impl DeviceConf {
    pub fn physical_login(&self) -> Option<&Credentials> {
        self.physical_credentials.as_ref().or(self.credentials.as_ref())
    }

    pub fn peer_names(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(PeerConf::name)
    }
}

impl Topology {
    /// Resolve the config path: explicit argument, then `TWIN_CONFIG`, then `devices.yaml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let txt = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&txt).map_err(|e| match e {
            ConfigError::Yaml { source, .. } => ConfigError::Yaml { path: path.to_path_buf(), source },
            other => other,
        })
    }

    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        let mut topo: Topology = serde_yaml::from_str(txt)
            .map_err(|source| ConfigError::Yaml { path: PathBuf::from("<inline>"), source })?;
        for (name, dev) in topo.devices.iter_mut() {
            dev.name = name.clone();
        }
        topo.validate()?;
        Ok(topo)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices declared".into()));
        }
        let m = &self.monitor;
        for (label, value) in [
            ("device_fail_threshold", m.device_fail_threshold),
            ("device_recover_threshold", m.device_recover_threshold),
            ("connection_fail_threshold", m.connection_fail_threshold),
            ("connection_recover_threshold", m.connection_recover_threshold),
            ("probe_fail_threshold", m.probe_fail_threshold),
            ("probe_recover_threshold", m.probe_recover_threshold),
            ("ping_count", m.ping_count),
            ("router.privilege_attempts", self.router.privilege_attempts),
            ("router.reconnect.max_attempts", self.router.reconnect.max_attempts),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{label} must be at least 1")));
            }
        }
        if m.check_interval_seconds == 0 || m.probe_interval_seconds == 0 {
            return Err(ConfigError::Invalid("intervals must be at least 1 second".into()));
        }
        if m.event_queue_depth == 0 {
            return Err(ConfigError::Invalid("event_queue_depth must be at least 1".into()));
        }
        let prefix = m.mqtt_prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains(['#', '+']) {
            return Err(ConfigError::Invalid(format!("invalid mqtt_prefix '{}'", m.mqtt_prefix)));
        }
        for dev in self.devices.values() {
            if dev.name.contains(['/', '#', '+']) {
                return Err(ConfigError::Invalid(format!("device name '{}' is not topic-safe", dev.name)));
            }
            for peer in dev.peer_names() {
                if peer == dev.name {
                    return Err(ConfigError::Invalid(format!("device '{}' lists itself as a peer", dev.name)));
                }
                if !self.devices.contains_key(peer) {
                    return Err(ConfigError::Invalid(format!(
                        "device '{}' lists unknown peer '{peer}'",
                        dev.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConf> {
        self.devices.get(name)
    }

    /// Topic prefix without surrounding slashes.
    pub fn prefix(&self) -> &str {
        self.monitor.mqtt_prefix.trim_matches('/')
    }

    /// Expected physical links, derived from every device's peer list.
    pub fn connection_pairs(&self) -> BTreeSet<PairKey> {
        self.devices
            .values()
            .flat_map(|dev| dev.peer_names().map(move |peer| PairKey::new(&dev.name, peer)))
            .collect()
    }

    /// Broker host: explicit `mqtt.host`, else the physical address of the broker device.
    pub fn mqtt_host(&self) -> Result<String, ConfigError> {
        if let Some(host) = &self.mqtt.host {
            return Ok(host.clone());
        }
        self.devices
            .values()
            .find(|d| d.kind == DeviceType::Broker)
            .map(|d| d.physical.to_string())
            .ok_or_else(|| ConfigError::Invalid("mqtt.host missing and no broker device declared".into()))
    }
}
