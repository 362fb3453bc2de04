//! SSH sessions bound to a chosen local source address
//!
//! The lab hosts sit on several networks at once; the physical and digital
//! sides are only reachable from specific interfaces, so every session binds
//! its TCP socket before connecting.

use crate::backoff::{reconnect_with_backoff, Reconnect, ReconnectPolicy};
use crate::cli::CliChannel;
use crate::error::TransportError;
use crate::remote::ExecOutput;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info};

#[derive(Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: IpAddr,
    pub port: u16,
    pub bind: Option<IpAddr>,
    pub user: String,
    pub password: String,
}

impl SshEndpoint {
    /// Pool key: one session per (source, destination, user).
    pub fn key(&self) -> String {
        match self.bind {
            Some(b) => format!("{}@{}:{}#{b}", self.user, self.host, self.port),
            None => format!("{}@{}:{}", self.user, self.host, self.port),
        }
    }
}

impl fmt::Debug for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bind", &self.bind)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SshTimeouts {
    pub connect: Duration,
    pub command: Duration,
    pub keepalive: Option<Duration>,
}

impl Default for SshTimeouts {
    fn default() -> Self {
        Self { connect: Duration::from_secs(10), command: Duration::from_secs(20), keepalive: None }
    }
}

/// Lab devices are re-imaged often, so host keys are accepted and logged.
struct LabHostKeys {
    host: String,
}

#[async_trait]
impl client::Handler for LabHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &russh_keys::key::PublicKey) -> Result<bool, Self::Error> {
        debug!(host = %self.host, fingerprint = %key.fingerprint(), "accepting host key");
        Ok(true)
    }
}

pub struct SshSession {
    endpoint: SshEndpoint,
    timeouts: SshTimeouts,
    handle: Option<Handle<LabHostKeys>>,
    last_used: Option<Instant>,
}

impl SshSession {
    pub fn new(endpoint: SshEndpoint, timeouts: SshTimeouts) -> Self {
        Self { endpoint, timeouts, handle: None, last_used: None }
    }

    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_closed())
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    fn host(&self) -> String {
        self.endpoint.host.to_string()
    }

    fn ssh_err(&self, source: russh::Error) -> TransportError {
        TransportError::Ssh { host: self.host(), source }
    }

    fn timed_out(&self, what: &'static str, limit: Duration) -> TransportError {
        TransportError::Timeout { host: self.host(), what, secs: limit.as_secs() }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.close().await;
        let ep = &self.endpoint;
        let limit = self.timeouts.connect;
        let target = SocketAddr::new(ep.host, ep.port);

        let socket = match ep.host {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| TransportError::Connect { host: self.host(), reason: e.to_string() })?;
        if let Some(bind) = ep.bind {
            socket
                .bind(SocketAddr::new(bind, 0))
                .map_err(|source| TransportError::Bind { addr: bind, source })?;
        }

        let stream = timeout(limit, socket.connect(target))
            .await
            .map_err(|_| self.timed_out("tcp connect", limit))?
            .map_err(|e| TransportError::Connect { host: self.host(), reason: e.to_string() })?;

        let config = Arc::new(client::Config {
            keepalive_interval: self.timeouts.keepalive,
            ..client::Config::default()
        });
        let handler = LabHostKeys { host: self.host() };
        let mut handle = timeout(limit, client::connect_stream(config, stream, handler))
            .await
            .map_err(|_| self.timed_out("ssh handshake", limit))?
            .map_err(|e| self.ssh_err(e))?;

        let accepted = timeout(limit, handle.authenticate_password(ep.user.clone(), ep.password.clone()))
            .await
            .map_err(|_| self.timed_out("authentication", limit))?
            .map_err(|e| self.ssh_err(e))?;
        if !accepted {
            return Err(TransportError::AuthRejected { host: self.host(), user: ep.user.clone() });
        }

        info!(endpoint = %self.endpoint, bind = ?self.endpoint.bind, "ssh session established");
        self.handle = Some(handle);
        self.last_used = Some(Instant::now());
        Ok(())
    }

    /// Reuse the live session or reconnect with backoff.
    pub async fn ensure_connected(&mut self, policy: &ReconnectPolicy) -> Result<(), TransportError> {
        if self.is_active() {
            return Ok(());
        }
        reconnect_with_backoff(self, policy).await
    }

    async fn open_channel(&mut self) -> Result<Channel<Msg>, TransportError> {
        let limit = self.timeouts.connect;
        let handle = self.handle.as_ref().ok_or_else(|| TransportError::Closed { host: self.host() })?;
        let opened = timeout(limit, handle.channel_open_session()).await;
        match opened {
            Ok(Ok(channel)) => {
                self.last_used = Some(Instant::now());
                Ok(channel)
            }
            Ok(Err(e)) => {
                self.handle = None;
                Err(self.ssh_err(e))
            }
            Err(_) => {
                self.handle = None;
                Err(self.timed_out("channel open", limit))
            }
        }
    }

    /// Run a command on an exec channel, collecting output until the channel
    /// closes or the command timeout expires.
    pub async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self.open_channel().await?;
        if let Err(e) = channel.exec(true, command).await {
            self.handle = None;
            return Err(self.ssh_err(e));
        }

        let limit = self.timeouts.command;
        let deadline = Instant::now() + limit;
        let mut out = ExecOutput::default();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            match timeout_at(deadline, channel.wait()).await {
                Err(_) => {
                    let _ = channel.close().await;
                    return Err(self.timed_out("command", limit));
                }
                Ok(None) | Ok(Some(ChannelMsg::Close)) => break,
                Ok(Some(ChannelMsg::Data { ref data })) => stdout.extend_from_slice(data),
                Ok(Some(ChannelMsg::ExtendedData { ref data, ext })) if ext == 1 => stderr.extend_from_slice(data),
                Ok(Some(ChannelMsg::ExitStatus { exit_status })) => out.exit_status = Some(exit_status),
                Ok(Some(_)) => {}
            }
        }
        let _ = channel.close().await;

        out.stdout = String::from_utf8_lossy(&stdout).into_owned();
        out.stderr = String::from_utf8_lossy(&stderr).into_owned();
        debug!(endpoint = %self.endpoint, status = ?out.exit_status, "exec finished");
        Ok(out)
    }

    /// Open a PTY shell for interactive CLIs.
    pub async fn open_shell(&mut self) -> Result<SshShell, TransportError> {
        let channel = self.open_channel().await?;
        let setup = async {
            channel.request_pty(false, "vt100", 200, 48, 0, 0, &[]).await?;
            channel.request_shell(false).await
        };
        if let Err(e) = setup.await {
            self.handle = None;
            return Err(self.ssh_err(e));
        }
        Ok(SshShell { channel, peer: self.host() })
    }

    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            debug!(endpoint = %self.endpoint, "ssh session closed");
        }
    }
}

#[async_trait]
impl Reconnect for SshSession {
    async fn attempt(&mut self) -> Result<(), TransportError> {
        self.connect().await
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Interactive shell channel on an [`SshSession`].
pub struct SshShell {
    channel: Channel<Msg>,
    peer: String,
}

#[async_trait]
impl CliChannel for SshShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel
            .data(data)
            .await
            .map_err(|source| TransportError::Ssh { host: self.peer.clone(), source })
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    return Ok(Some(data.to_vec()));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
