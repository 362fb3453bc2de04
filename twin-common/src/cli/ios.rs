//! IOS CLI automaton
//!
//! Drives an interactive shell through
//! `Disconnected -> User -> Privileged -> Config -> Privileged -> Disconnected`,
//! scanning every reply against the token tables. Each operation returns the
//! device transcript so callers can log exactly what the router said.

use super::read::{read_until, Capture, ReadEnd, ReadWindow};
use super::tokens::{
    ping_verdict, Scan, TokenTable, ANY_PROMPT, CONFIG_PROMPT, ENABLE_DENIED, ENABLE_REPLY, IOS_ERRORS,
    PASSWORD_CHALLENGE, PING_COMPLETE, PRIVILEGED_PROMPT, USER_PROMPT,
};
use super::CliChannel;
use crate::error::{CliError, TransportError};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CliMode {
    Disconnected,
    User,
    Privileged,
    Config,
}

#[derive(Debug, Clone)]
pub struct IosSettings {
    pub enable_secret: String,
    pub privilege_attempts: u32,
    pub command_delay: Duration,
    pub window: ReadWindow,
}

impl Default for IosSettings {
    fn default() -> Self {
        Self {
            enable_secret: String::new(),
            privilege_attempts: 3,
            command_delay: Duration::from_millis(300),
            window: ReadWindow::new(Duration::from_millis(800), Duration::from_secs(10)),
        }
    }
}

/// Result of the two verification queries for one discard route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteCheck {
    /// The discard route is in the running configuration.
    pub present: bool,
    /// The routing table resolves the address to Null0.
    pub rib_present: bool,
    pub rib_text: String,
    pub running_config_text: String,
}

/// Config-mode line installing a host discard route for `peer`.
pub fn discard_route(peer: IpAddr) -> String {
    match peer {
        IpAddr::V4(a) => format!("ip route {a} 255.255.255.255 Null0"),
        IpAddr::V6(a) => format!("ipv6 route {a}/128 Null0"),
    }
}

pub fn remove_discard_route(peer: IpAddr) -> String {
    format!("no {}", discard_route(peer))
}

/// Leading text of a running-config line for a static route to `peer`.
fn route_line_prefix(peer: IpAddr) -> String {
    match peer {
        IpAddr::V4(a) => format!("ip route {a} "),
        IpAddr::V6(a) => format!("ipv6 route {a}/128 "),
    }
}

fn rib_query(peer: IpAddr) -> String {
    match peer {
        IpAddr::V4(a) => format!("show ip route {a}"),
        IpAddr::V6(a) => format!("show ipv6 route {a}"),
    }
}

pub struct IosCli {
    chan: Box<dyn CliChannel>,
    mode: CliMode,
    settings: IosSettings,
    host: String,
}

impl IosCli {
    /// Wait for the first prompt on a freshly opened shell.
    pub async fn attach(chan: Box<dyn CliChannel>, settings: IosSettings) -> Result<Self, CliError> {
        let host = chan.peer().to_string();
        let mut cli = Self { chan, mode: CliMode::Disconnected, settings, host };

        let first = read_until(cli.chan.as_mut(), cli.settings.window, Some(&ANY_PROMPT)).await?;
        let banner = match first.end {
            ReadEnd::Marker(_) => first,
            ReadEnd::Closed => return Err(cli.closed()),
            // some images only print the prompt after a keystroke
            ReadEnd::Quiescent | ReadEnd::Deadline => {
                cli.chan.send(b"\n").await?;
                cli.read(&ANY_PROMPT).await?
            }
        };
        cli.mode = mode_of(&banner.text).ok_or_else(|| CliError::WrongMode {
            host: cli.host.clone(),
            expected: "an exec prompt",
        })?;
        if cli.mode == CliMode::Config {
            cli.leave_config().await?;
        }
        debug!(host = %cli.host, mode = ?cli.mode, "cli attached");
        Ok(cli)
    }

    pub fn mode(&self) -> CliMode {
        self.mode
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn read(&mut self, marker: &TokenTable) -> Result<Capture, CliError> {
        let cap = read_until(self.chan.as_mut(), self.settings.window, Some(marker)).await?;
        self.complete(cap, marker)
    }

    /// Reject a capture the device did not finish. Quiescence is a complete
    /// reply; a deadline or a closed channel is not.
    fn complete(&self, cap: Capture, marker: &TokenTable) -> Result<Capture, CliError> {
        match cap.end {
            ReadEnd::Marker(_) | ReadEnd::Quiescent => Ok(cap),
            ReadEnd::Closed => Err(self.closed()),
            ReadEnd::Deadline => {
                warn!(host = %self.host, waiting_for = marker.name, transcript = %cap.text, "cli reply cut off");
                Err(CliError::Incomplete { host: self.host.clone(), waiting_for: marker.name, transcript: cap.text })
            }
        }
    }

    fn closed(&self) -> CliError {
        TransportError::Closed { host: self.host.clone() }.into()
    }

    async fn exchange(&mut self, line: &str, marker: &TokenTable) -> Result<Capture, CliError> {
        self.chan.send(format!("{line}\n").as_bytes()).await?;
        self.read(marker).await
    }

    async fn leave_config(&mut self) -> Result<String, CliError> {
        let cap = self.exchange("end", &PRIVILEGED_PROMPT).await?;
        if !PRIVILEGED_PROMPT.scan(&cap.text).is_matched() {
            return Err(CliError::WrongMode { host: self.host.clone(), expected: "privileged" });
        }
        self.mode = CliMode::Privileged;
        Ok(cap.text)
    }

    /// Elevate with `enable`. The secret is only sent when the device asks
    /// for it, and never lands in the transcript.
    pub async fn enter_privileged(&mut self) -> Result<(), CliError> {
        match self.mode {
            CliMode::Privileged => return Ok(()),
            CliMode::Config => {
                self.leave_config().await?;
                return Ok(());
            }
            CliMode::Disconnected => {
                return Err(CliError::WrongMode { host: self.host.clone(), expected: "connected" });
            }
            CliMode::User => {}
        }

        let attempts = self.settings.privilege_attempts.max(1);
        let mut transcript = String::new();
        for attempt in 1..=attempts {
            let cap = self.exchange("enable", &ENABLE_REPLY).await?;
            transcript.push_str(&cap.text);
            let mut reply = cap.text;

            if PASSWORD_CHALLENGE.scan(&reply).is_matched() {
                let secret = format!("{}\n", self.settings.enable_secret);
                self.chan.send(secret.as_bytes()).await?;
                let cap = self.read(&ANY_PROMPT).await?;
                transcript.push_str(&cap.text);
                reply = cap.text;
            }

            if PRIVILEGED_PROMPT.scan(&reply).is_matched() {
                self.mode = CliMode::Privileged;
                debug!(host = %self.host, attempt, "privileged mode");
                return Ok(());
            }
            if let Scan::Matched(token) = ENABLE_DENIED.scan(&reply) {
                debug!(host = %self.host, attempt, token, "enable refused");
            }
            // a refused secret can leave the device at a repeated challenge
            if PASSWORD_CHALLENGE.scan(&reply).is_matched() {
                self.chan.send(b"\n").await?;
                let cap = self.read(&USER_PROMPT).await?;
                transcript.push_str(&cap.text);
            }
        }
        Err(CliError::PrivilegeDenied { host: self.host.clone(), attempts, transcript })
    }

    /// Disable paging and enter global configuration mode.
    pub async fn enter_config(&mut self) -> Result<String, CliError> {
        if self.mode == CliMode::Config {
            return Ok(String::new());
        }
        self.enter_privileged().await?;

        let mut transcript = self.exchange("terminal length 0", &PRIVILEGED_PROMPT).await?.text;
        let cap = self.exchange("configure terminal", &CONFIG_PROMPT).await?;
        transcript.push_str(&cap.text);

        if let Scan::Matched(token) = IOS_ERRORS.scan(&transcript) {
            return Err(CliError::ConfigModeRejected { host: self.host.clone(), token: token.into(), transcript });
        }
        if !CONFIG_PROMPT.scan(&cap.text).is_matched() {
            return Err(CliError::ConfigModeRejected {
                host: self.host.clone(),
                token: "no configuration prompt".into(),
                transcript,
            });
        }
        self.mode = CliMode::Config;
        Ok(transcript)
    }

    /// Run `commands` in configuration mode, then return to privileged mode.
    /// Any error token in the accumulated output fails the whole apply.
    pub async fn apply(&mut self, commands: &[String], persist: bool) -> Result<String, CliError> {
        let mut transcript = self.enter_config().await?;
        for line in commands {
            self.chan.send(format!("{line}\n").as_bytes()).await?;
            tokio::time::sleep(self.settings.command_delay).await;
            let cap = self.read(&CONFIG_PROMPT).await?;
            transcript.push_str(&cap.text);
        }
        let tail = self.leave_config().await?;
        transcript.push_str(&tail);

        if let Scan::Matched(token) = IOS_ERRORS.scan(&transcript) {
            warn!(host = %self.host, token, transcript = %transcript, "cli rejected configuration");
            return Err(CliError::CommandRejected { host: self.host.clone(), token: token.into(), transcript });
        }

        if persist {
            let cap = self.exchange("write memory", &PRIVILEGED_PROMPT).await?;
            transcript.push_str(&cap.text);
            if let Scan::Matched(token) = IOS_ERRORS.scan(&cap.text) {
                return Err(CliError::CommandRejected { host: self.host.clone(), token: token.into(), transcript });
            }
            info!(host = %self.host, "configuration saved");
        }
        Ok(transcript)
    }

    /// Query running config and RIB for the discard route to `peer`.
    pub async fn verify(&mut self, peer: IpAddr) -> Result<RouteCheck, CliError> {
        self.enter_privileged().await?;
        let prefix = route_line_prefix(peer);

        let running = self
            .exchange(&format!("show running-config | include {}", prefix.trim_end()), &PRIVILEGED_PROMPT)
            .await?
            .text;
        let rib = self.exchange(&rib_query(peer), &PRIVILEGED_PROMPT).await?.text;

        let present = running
            .lines()
            .map(str::trim)
            .any(|l| l.starts_with(&prefix) && l.to_ascii_lowercase().contains("null0"));
        let rib_present = !rib.to_ascii_lowercase().contains("not in table") && rib.to_ascii_lowercase().contains("null0");

        Ok(RouteCheck { present, rib_present, rib_text: rib, running_config_text: running })
    }

    /// Ping `peer` from the device itself. Works from user or privileged mode.
    pub async fn ping(&mut self, peer: IpAddr, repeat: u32, timeout_secs: u64, deadline: Duration) -> Result<(bool, String), CliError> {
        if self.mode == CliMode::Config {
            self.leave_config().await?;
        }
        let line = format!("ping {peer} repeat {repeat} timeout {timeout_secs}\n");
        self.chan.send(line.as_bytes()).await?;
        let cap = read_until(self.chan.as_mut(), ReadWindow::until_marker(deadline), Some(&PING_COMPLETE)).await?;
        let cap = self.complete(cap, &PING_COMPLETE)?;
        Ok((ping_verdict(&cap.text), cap.text))
    }

    pub async fn close(&mut self) {
        if self.mode == CliMode::Config {
            let _ = self.chan.send(b"end\n").await;
        }
        if self.mode != CliMode::Disconnected {
            let _ = self.chan.send(b"exit\n").await;
        }
        self.chan.close().await;
        self.mode = CliMode::Disconnected;
    }
}

fn mode_of(text: &str) -> Option<CliMode> {
    if CONFIG_PROMPT.scan(text).is_matched() {
        Some(CliMode::Config)
    } else if PRIVILEGED_PROMPT.scan(text).is_matched() {
        Some(CliMode::Privileged)
    } else if USER_PROMPT.scan(text).is_matched() {
        Some(CliMode::User)
    } else {
        None
    }
}
