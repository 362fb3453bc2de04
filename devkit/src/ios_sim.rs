/*!
Scripted IOS router

Emulates just enough of an IOS exec shell for the CLI automaton: user and
privileged modes with an optional enable secret, configuration mode,
static discard routes, `show` queries, `write memory` and `ping`. Faults
(rejected commands, routes that do not stick, failed connects, dropped
sessions) are switched on per test.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use twin_common::backoff::{reconnect_with_backoff, Reconnect, ReconnectPolicy};
use twin_common::cli::CliChannel;
use twin_common::error::TransportError;
use twin_common::remote::CliConnector;
use twin_common::ssh::SshEndpoint;

const INVALID_INPUT: &str = "% Invalid input detected at '^' marker.";

#[derive(Debug, Default)]
struct RouterState {
    hostname: String,
    enable_secret: String,
    routes: BTreeSet<String>,
    config_commands: Vec<String>,
    rejected: Vec<String>,
    ignore_route_changes: bool,
    saves: u32,
    unreachable: BTreeSet<String>,
    pings: Vec<String>,
    failing_opens: u32,
    opens: u32,
    stall_pings: bool,
    generation: u64,
}

/// Shared handle on one simulated router. Clones observe the same device.
#[derive(Clone, Default)]
pub struct ScriptedIosDevice {
    state: Arc<Mutex<RouterState>>,
}

impl ScriptedIosDevice {
    /// `enable_secret` empty means `enable` needs no password.
    pub fn new(hostname: &str, enable_secret: &str) -> Self {
        let state = RouterState {
            hostname: hostname.to_string(),
            enable_secret: enable_secret.to_string(),
            ..RouterState::default()
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn connector(&self) -> IosSimConnector {
        IosSimConnector { device: self.clone() }
    }

    /// Open a shell directly, bypassing the connector.
    pub fn shell(&self, peer: &str) -> IosSimShell {
        let mut state = self.state.lock();
        state.opens += 1;
        IosSimShell::new(self.clone(), peer, &state.hostname, state.generation)
    }

    pub fn has_route(&self, addr: &str) -> bool {
        let v4 = format!("ip route {addr} ");
        let v6 = format!("ipv6 route {addr}/128 ");
        self.state.lock().routes.iter().any(|r| r.starts_with(&v4) || r.starts_with(&v6))
    }

    pub fn add_route(&self, line: &str) {
        self.state.lock().routes.insert(line.to_string());
    }

    /// Lines entered in configuration mode, in order.
    pub fn config_commands(&self) -> Vec<String> {
        self.state.lock().config_commands.clone()
    }

    pub fn reject_commands_containing(&self, needle: &str) {
        self.state.lock().rejected.push(needle.to_string());
    }

    /// Accept route commands without changing the table.
    pub fn ignore_route_changes(&self) {
        self.state.lock().ignore_route_changes = true;
    }

    pub fn saves(&self) -> u32 {
        self.state.lock().saves
    }

    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.unreachable.remove(addr);
        } else {
            state.unreachable.insert(addr.to_string());
        }
    }

    /// Targets pinged from the device, in order.
    pub fn pings(&self) -> Vec<String> {
        self.state.lock().pings.clone()
    }

    /// Pings print their header and then go quiet, never reaching the summary.
    pub fn stall_pings(&self, stall: bool) {
        self.state.lock().stall_pings = stall;
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().failing_opens = n;
    }

    /// Successful shell opens so far.
    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    /// Kill every open shell, as a reload or a dropped link would.
    pub fn drop_sessions(&self) {
        self.state.lock().generation += 1;
    }

    fn prompt(&self, mode: Mode) -> String {
        let host = &self.state.lock().hostname;
        match mode {
            Mode::User => format!("{host}>"),
            Mode::Privileged => format!("{host}#"),
            Mode::Config => format!("{host}(config)#"),
        }
    }

    fn show_running(&self, pattern: &str) -> String {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|r| r.contains(pattern))
            .map(|r| format!("{r}\r\n"))
            .collect()
    }

    fn show_route(&self, addr: &str, v6: bool) -> String {
        if !self.has_route(addr) {
            return "% Network not in table\r\n".to_string();
        }
        let mask = if v6 { "128" } else { "32" };
        format!(
            "Routing entry for {addr}/{mask}\r\n  Known via \"static\", distance 1, metric 0 (connected)\r\n  Routing Descriptor Blocks:\r\n  * directly connected, via Null0\r\n      Route metric is 0, traffic share count is 1\r\n"
        )
    }

    fn ping(&self, line: &str) -> String {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(target) = words.get(1).map(|s| s.to_string()) else {
            return format!("{INVALID_INPUT}\r\n");
        };
        let repeat = option_after(&words, "repeat").unwrap_or(5);
        let timeout = option_after(&words, "timeout").unwrap_or(2);
        let alive = {
            let mut state = self.state.lock();
            state.pings.push(target.clone());
            !state.unreachable.contains(&target)
        };
        let (glyph, ok) = if alive { ('!', repeat) } else { ('.', 0) };
        let rate = ok * 100 / repeat.max(1);
        let mut out = format!(
            "Type escape sequence to abort.\r\nSending {repeat}, 100-byte ICMP Echos to {target}, timeout is {timeout} seconds:\r\n{}\r\nSuccess rate is {rate} percent ({ok}/{repeat})",
            glyph.to_string().repeat(repeat as usize)
        );
        if alive {
            out.push_str(", round-trip min/avg/max = 1/1/2 ms");
        }
        out.push_str("\r\n");
        out
    }

    fn configure(&self, line: &str) -> String {
        let mut state = self.state.lock();
        state.config_commands.push(line.to_string());
        if state.rejected.iter().any(|r| line.contains(r.as_str())) {
            return format!("                ^\r\n{INVALID_INPUT}\r\n\r\n");
        }
        if state.ignore_route_changes {
            return String::new();
        }
        match line.strip_prefix("no ") {
            Some(route) => {
                state.routes.remove(route.trim());
            }
            None if line.starts_with("ip route ") || line.starts_with("ipv6 route ") => {
                state.routes.insert(line.to_string());
            }
            None => {}
        }
        String::new()
    }

    fn is_live(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }
}

fn option_after(words: &[&str], key: &str) -> Option<u32> {
    let idx = words.iter().position(|w| *w == key)?;
    words.get(idx + 1)?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    User,
    Privileged,
    Config,
}

pub struct IosSimConnector {
    device: ScriptedIosDevice,
}

#[async_trait]
impl CliConnector for IosSimConnector {
    async fn open(&mut self, endpoint: &SshEndpoint) -> Result<Box<dyn CliChannel>, TransportError> {
        {
            let mut state = self.device.state.lock();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(TransportError::Connect {
                    host: endpoint.host.to_string(),
                    reason: "connection refused".into(),
                });
            }
        }
        Ok(Box::new(self.device.shell(&endpoint.host.to_string())))
    }

    async fn close_all(&mut self) {}
}

/// A router that black-holes SSH: every connection attempt hangs for
/// `per_attempt` and then times out. Opens go through the real capped
/// backoff, so tests see the same attempt pattern a dead router produces.
pub struct UnresponsiveRouter {
    policy: ReconnectPolicy,
    per_attempt: Duration,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

/// Start times of every connection attempt made against an [`UnresponsiveRouter`].
#[derive(Clone, Default)]
pub struct AttemptLog {
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl AttemptLog {
    pub fn count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

impl UnresponsiveRouter {
    pub fn new(policy: ReconnectPolicy, per_attempt: Duration) -> (Self, AttemptLog) {
        let log = AttemptLog::default();
        let router = Self { policy, per_attempt, attempts: log.attempts.clone() };
        (router, log)
    }
}

struct HangingDial<'a> {
    host: String,
    per_attempt: Duration,
    attempts: &'a Mutex<Vec<Instant>>,
}

#[async_trait]
impl Reconnect for HangingDial<'_> {
    async fn attempt(&mut self) -> Result<(), TransportError> {
        self.attempts.lock().push(Instant::now());
        tokio::time::sleep(self.per_attempt).await;
        Err(TransportError::Timeout { host: self.host.clone(), what: "tcp connect", secs: self.per_attempt.as_secs() })
    }

    fn describe(&self) -> String {
        self.host.clone()
    }
}

#[async_trait]
impl CliConnector for UnresponsiveRouter {
    async fn open(&mut self, endpoint: &SshEndpoint) -> Result<Box<dyn CliChannel>, TransportError> {
        let mut dial = HangingDial {
            host: endpoint.host.to_string(),
            per_attempt: self.per_attempt,
            attempts: &self.attempts,
        };
        reconnect_with_backoff(&mut dial, &self.policy).await?;
        Err(TransportError::Closed { host: endpoint.host.to_string() })
    }

    async fn close_all(&mut self) {}
}

/// One interactive session on the simulated router.
pub struct IosSimShell {
    device: ScriptedIosDevice,
    peer: String,
    generation: u64,
    mode: Mode,
    awaiting_secret: bool,
    partial: String,
    pending: VecDeque<Vec<u8>>,
    closed: bool,
}

impl IosSimShell {
    fn new(device: ScriptedIosDevice, peer: &str, hostname: &str, generation: u64) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(format!("\r\n{hostname}>").into_bytes());
        Self {
            device,
            peer: peer.to_string(),
            generation,
            mode: Mode::User,
            awaiting_secret: false,
            partial: String::new(),
            pending,
            closed: false,
        }
    }

    fn alive(&self) -> bool {
        !self.closed && self.device.is_live(self.generation)
    }

    fn handle_line(&mut self, line: &str) {
        if self.awaiting_secret {
            self.awaiting_secret = false;
            let accepted = line == self.device.state.lock().enable_secret;
            let reply = if accepted {
                self.mode = Mode::Privileged;
                "\r\n".to_string()
            } else {
                "\r\n% Bad secrets\r\n\r\n".to_string()
            };
            self.reply(reply);
            return;
        }

        let mut out = format!("{line}\r\n");
        match (self.mode, line) {
            (_, "") => {}
            (Mode::Config, "end") => self.mode = Mode::Privileged,
            (Mode::Config, cmd) => out.push_str(&self.device.configure(cmd)),
            (_, "exit") => {
                self.closed = true;
                return;
            }
            (Mode::User, "enable") => {
                if self.device.state.lock().enable_secret.is_empty() {
                    self.mode = Mode::Privileged;
                } else {
                    self.awaiting_secret = true;
                    self.pending.push_back(format!("{out}Password: ").into_bytes());
                    return;
                }
            }
            (_, cmd) if cmd.starts_with("ping ") && self.device.state.lock().stall_pings => {
                out.push_str("Type escape sequence to abort.\r\n!!");
                self.pending.push_back(out.into_bytes());
                return;
            }
            (_, cmd) if cmd.starts_with("ping ") => out.push_str(&self.device.ping(cmd)),
            (Mode::Privileged, "enable" | "terminal length 0") => {}
            (Mode::Privileged, "disable") => self.mode = Mode::User,
            (Mode::Privileged, "configure terminal") => {
                out.push_str("Enter configuration commands, one per line.  End with CNTL/Z.\r\n");
                self.mode = Mode::Config;
            }
            (Mode::Privileged, "write memory") => {
                self.device.state.lock().saves += 1;
                out.push_str("Building configuration...\r\n[OK]\r\n");
            }
            (Mode::Privileged, cmd) if cmd.starts_with("show running-config | include ") => {
                let pattern = cmd.trim_start_matches("show running-config | include ");
                out.push_str(&self.device.show_running(pattern));
            }
            (Mode::Privileged, cmd) if cmd.starts_with("show ip route ") => {
                out.push_str(&self.device.show_route(cmd.trim_start_matches("show ip route "), false));
            }
            (Mode::Privileged, cmd) if cmd.starts_with("show ipv6 route ") => {
                out.push_str(&self.device.show_route(cmd.trim_start_matches("show ipv6 route "), true));
            }
            _ => out.push_str(&format!("                ^\r\n{INVALID_INPUT}\r\n\r\n")),
        }
        self.reply(out);
    }

    fn reply(&mut self, mut body: String) {
        body.push_str(&self.device.prompt(self.mode));
        self.pending.push_back(body.into_bytes());
    }
}

#[async_trait]
impl CliChannel for IosSimShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.alive() {
            return Err(TransportError::Closed { host: self.peer.clone() });
        }
        self.partial.push_str(&String::from_utf8_lossy(data));
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            self.handle_line(line.trim());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.device.is_live(self.generation) {
            return Ok(None);
        }
        match self.pending.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.closed => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use twin_common::cli::{CliMode, IosCli, IosSettings, ReadWindow};

    fn settings(secret: &str) -> IosSettings {
        IosSettings {
            enable_secret: secret.into(),
            privilege_attempts: 2,
            command_delay: Duration::from_millis(10),
            window: ReadWindow::new(Duration::from_millis(100), Duration::from_secs(2)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_with_secret_and_route_roundtrip() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut cli = IosCli::attach(Box::new(device.shell("r1")), settings("class")).await.unwrap();
        assert_eq!(cli.mode(), CliMode::User);

        cli.apply(&["ip route 10.10.0.3 255.255.255.255 Null0".to_string()], false).await.unwrap();
        assert_eq!(cli.mode(), CliMode::Privileged);
        assert!(device.has_route("10.10.0.3"));

        let check = cli.verify("10.10.0.3".parse().unwrap()).await.unwrap();
        assert!(check.present && check.rib_present);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_secret_is_refused() {
        let device = ScriptedIosDevice::new("R1", "class");
        let mut cli = IosCli::attach(Box::new(device.shell("r1")), settings("nope")).await.unwrap();
        let err = cli.enter_privileged().await.unwrap_err();
        assert!(err.transcript().unwrap_or_default().contains("Bad secrets"));
        assert!(!err.transcript().unwrap_or_default().contains("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_reports_reachability() {
        let device = ScriptedIosDevice::new("R1", "");
        device.set_reachable("192.168.20.3", false);
        let mut cli = IosCli::attach(Box::new(device.shell("r1")), settings("")).await.unwrap();

        let (ok, text) = cli.ping("192.168.20.2".parse().unwrap(), 3, 2, Duration::from_secs(14)).await.unwrap();
        assert!(ok, "{text}");
        let (ok, text) = cli.ping("192.168.20.3".parse().unwrap(), 3, 2, Duration::from_secs(14)).await.unwrap();
        assert!(!ok);
        assert!(text.contains("Success rate is 0 percent"));
        assert_eq!(device.pings(), vec!["192.168.20.2", "192.168.20.3"]);
    }

    #[tokio::test]
    async fn test_dropped_session_refuses_sends() {
        let device = ScriptedIosDevice::new("R1", "");
        let mut shell = device.shell("r1");
        device.drop_sessions();
        assert!(shell.send(b"enable\n").await.is_err());
        assert_eq!(shell.recv().await.unwrap(), None);
    }
}
