//! Twin Common - shared building blocks for the digital-twin sync agents
//!
//! Everything the coordinator and the probes have in common lives here:
//! - Topology configuration (devices.yaml) and validation
//! - Health events and MQTT topic conventions
//! - Debounce / hysteresis tracker
//! - SSH sessions bound to a local source address, with capped backoff
//! - Table-driven CLI scanning and the IOS CLI automaton
//! - Trait seams for enforcement, power and liveness backends

pub mod backoff;
pub mod bus;
pub mod cli;
pub mod config;
pub mod debounce;
pub mod enforcement;
pub mod error;
pub mod liveness;
pub mod models;
pub mod ping;
pub mod remote;
pub mod ssh;
pub mod telemetry;

pub use config::{DeviceConf, DeviceType, Topology};
pub use debounce::{DebounceTracker, SettledState, Thresholds, Transition};
pub use error::{CliError, ConfigError, SyncError, TransportError};
pub use models::{HealthEvent, HealthStatus, PairKey};
