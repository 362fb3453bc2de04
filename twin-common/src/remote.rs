//! Seams between backends and the transport that carries their commands

use crate::backoff::ReconnectPolicy;
use crate::cli::CliChannel;
use crate::error::TransportError;
use crate::ssh::{SshEndpoint, SshSession, SshTimeouts};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn exited(status: u32) -> Self {
        Self { exit_status: Some(status), ..Self::default() }
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Run one non-interactive command on a remote host.
#[async_trait]
pub trait RemoteExec: Send {
    async fn exec(&mut self, endpoint: &SshEndpoint, command: &str) -> Result<ExecOutput, TransportError>;
    async fn close_all(&mut self);
}

/// Open an interactive shell on a remote host.
#[async_trait]
pub trait CliConnector: Send {
    async fn open(&mut self, endpoint: &SshEndpoint) -> Result<Box<dyn CliChannel>, TransportError>;
    async fn close_all(&mut self);
}

/// Persistent SSH sessions keyed by endpoint, owned by exactly one backend.
/// A dead session is re-established lazily with capped backoff.
pub struct SshPool {
    timeouts: SshTimeouts,
    policy: ReconnectPolicy,
    sessions: HashMap<String, SshSession>,
}

impl SshPool {
    pub fn new(timeouts: SshTimeouts, policy: ReconnectPolicy) -> Self {
        Self { timeouts, policy, sessions: HashMap::new() }
    }

    async fn session(&mut self, endpoint: &SshEndpoint) -> Result<&mut SshSession, TransportError> {
        let timeouts = self.timeouts;
        let policy = self.policy;
        let session = self
            .sessions
            .entry(endpoint.key())
            .or_insert_with(|| SshSession::new(endpoint.clone(), timeouts));
        session.ensure_connected(&policy).await?;
        Ok(session)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }
}

#[async_trait]
impl RemoteExec for SshPool {
    async fn exec(&mut self, endpoint: &SshEndpoint, command: &str) -> Result<ExecOutput, TransportError> {
        let session = self.session(endpoint).await?;
        session.exec(command).await
    }

    async fn close_all(&mut self) {
        for (key, mut session) in self.sessions.drain() {
            debug!(session = %key, "closing ssh session");
            session.close().await;
        }
    }
}

#[async_trait]
impl CliConnector for SshPool {
    async fn open(&mut self, endpoint: &SshEndpoint) -> Result<Box<dyn CliChannel>, TransportError> {
        let session = self.session(endpoint).await?;
        let shell = session.open_shell().await?;
        Ok(Box::new(shell))
    }

    async fn close_all(&mut self) {
        RemoteExec::close_all(self).await;
    }
}
