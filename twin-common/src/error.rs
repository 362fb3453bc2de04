//! Error taxonomy shared by the coordinator, probes and backends

use std::path::PathBuf;
use thiserror::Error;

/// Startup configuration failures. The only fatal class besides shutdown.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid topology: {0}")]
    Invalid(String),
}

/// Session-level failures below any CLI or command semantics.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot bind local address {addr}: {source}")]
    Bind {
        addr: std::net::IpAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },
    #[error("{what} timed out after {secs}s on {host}")]
    Timeout { host: String, what: &'static str, secs: u64 },
    #[error("authentication rejected by {host} for user {user}")]
    AuthRejected { host: String, user: String },
    #[error("ssh error on {host}: {source}")]
    Ssh {
        host: String,
        #[source]
        source: russh::Error,
    },
    #[error("channel to {host} closed")]
    Closed { host: String },
    #[error("gave up on {target} after {attempts} attempts: {last}")]
    Exhausted { target: String, attempts: u32, last: Box<TransportError> },
}

/// Failures of the interactive CLI automaton. Every variant keeps what the
/// device printed so the operator can see why it refused.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{host}: privileged mode not reached after {attempts} attempts")]
    PrivilegeDenied { host: String, attempts: u32, transcript: String },
    #[error("{host}: configuration mode rejected ({token})")]
    ConfigModeRejected { host: String, token: String, transcript: String },
    #[error("{host}: command rejected ({token})")]
    CommandRejected { host: String, token: String, transcript: String },
    #[error("{host}: unexpected state, expected {expected}")]
    WrongMode { host: String, expected: &'static str },
    /// The deadline passed before the reply was complete; the rest of it may
    /// still be in flight, so the session cannot be trusted any more.
    #[error("{host}: no {waiting_for} before the deadline")]
    Incomplete { host: String, waiting_for: &'static str, transcript: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CliError {
    pub fn transcript(&self) -> Option<&str> {
        match self {
            CliError::PrivilegeDenied { transcript, .. }
            | CliError::ConfigModeRejected { transcript, .. }
            | CliError::CommandRejected { transcript, .. }
            | CliError::Incomplete { transcript, .. } => Some(transcript),
            _ => None,
        }
    }
}

/// Backend and probe failures. None of these escape a tick; the tick logs
/// them with `class()` as a field and retries on the next one.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    Transient(#[source] TransportError),
    #[error("cli parse error on {host}: {reason}")]
    ProtocolParse { host: String, reason: String, transcript: String },
    #[error("authentication failed on {host} as {user}")]
    Authentication { host: String, user: String },
    #[error("verification mismatch on {host} for {peer}: expected blocked={expected}")]
    VerificationMismatch { host: String, peer: String, expected: bool, before: String, after: String },
    #[error("orchestrator {method} {url} failed: {status} {body}")]
    OrchestratorApi { method: &'static str, url: String, status: String, body: String },
    #[error("remote command on {host} exited with {status}: {stderr}")]
    RemoteCommand { host: String, command: String, status: u32, stderr: String },
    #[error("{0}")]
    Unsupported(String),
}

impl SyncError {
    /// Stable label for log fields.
    pub fn class(&self) -> &'static str {
        match self {
            SyncError::Transient(_) => "transient_network",
            SyncError::ProtocolParse { .. } => "protocol_parse",
            SyncError::Authentication { .. } => "authentication",
            SyncError::VerificationMismatch { .. } => "verification_mismatch",
            SyncError::OrchestratorApi { .. } => "orchestrator_api",
            SyncError::RemoteCommand { .. } => "remote_command",
            SyncError::Unsupported(_) => "unsupported",
        }
    }

    pub fn transcript(&self) -> Option<&str> {
        match self {
            SyncError::ProtocolParse { transcript, .. } => Some(transcript),
            _ => None,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthRejected { host, user } => SyncError::Authentication { host, user },
            TransportError::Exhausted { last, .. } if matches!(*last, TransportError::AuthRejected { .. }) => {
                SyncError::from(*last)
            }
            other => SyncError::Transient(other),
        }
    }
}

impl From<CliError> for SyncError {
    fn from(err: CliError) -> Self {
        match err {
            CliError::Transport(t) => SyncError::from(t),
            CliError::PrivilegeDenied { host, attempts, transcript } => SyncError::ProtocolParse {
                host,
                reason: format!("privileged mode not reached after {attempts} attempts"),
                transcript,
            },
            CliError::ConfigModeRejected { host, token, transcript } => SyncError::ProtocolParse {
                host,
                reason: format!("configuration mode rejected: {token}"),
                transcript,
            },
            CliError::CommandRejected { host, token, transcript } => SyncError::ProtocolParse {
                host,
                reason: format!("command rejected: {token}"),
                transcript,
            },
            CliError::Incomplete { host, waiting_for, transcript } => SyncError::ProtocolParse {
                host,
                reason: format!("reply cut off waiting for {waiting_for}"),
                transcript,
            },
            CliError::WrongMode { host, expected } => SyncError::ProtocolParse {
                host,
                reason: format!("expected {expected} mode"),
                transcript: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejection_maps_to_authentication() {
        let err: SyncError = TransportError::AuthRejected { host: "r1".into(), user: "admin".into() }.into();
        assert_eq!(err.class(), "authentication");

        let exhausted = TransportError::Exhausted {
            target: "r1".into(),
            attempts: 5,
            last: Box::new(TransportError::AuthRejected { host: "r1".into(), user: "admin".into() }),
        };
        assert_eq!(SyncError::from(exhausted).class(), "authentication");
    }

    #[test]
    fn test_cli_rejection_keeps_transcript() {
        let cli = CliError::CommandRejected {
            host: "r1".into(),
            token: "% Invalid input".into(),
            transcript: "R1(config)#ip route x\n% Invalid input detected".into(),
        };
        assert!(cli.transcript().unwrap().contains("Invalid input detected"));
        let sync = SyncError::from(cli);
        assert_eq!(sync.class(), "protocol_parse");
        assert!(sync.transcript().unwrap().contains("Invalid input detected"));
    }

    #[test]
    fn test_cut_off_reply_is_protocol_parse_with_transcript() {
        let cli = CliError::Incomplete {
            host: "r1".into(),
            waiting_for: "ping-complete",
            transcript: "Sending 3, 100-byte ICMP Echos".into(),
        };
        let sync = SyncError::from(cli);
        assert_eq!(sync.class(), "protocol_parse");
        assert!(sync.to_string().contains("ping-complete"));
        assert!(sync.transcript().unwrap().contains("ICMP Echos"));
    }

    #[test]
    fn test_timeout_is_transient() {
        let err: SyncError = TransportError::Timeout { host: "h".into(), what: "connect", secs: 10 }.into();
        assert_eq!(err.class(), "transient_network");
    }
}
