/*!
Recording doubles for coordinator and probe tests

Each double hands out a log handle next to itself: the double moves into the
code under test, the handle stays with the test to script faults and read
back what happened.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use twin_common::enforcement::{
    BackendKind, EnforcementBackend, EnforcementTarget, LinkBackend, LinkInfo, NodeState, Outcome, PowerBackend,
};
use twin_common::error::{SyncError, TransportError};
use twin_common::liveness::{LivenessCheck, PeerTarget};
use twin_common::ping::Reachability;

/// Route `log` and `tracing` output to the test harness. Safe to call from
/// every test; `RUST_LOG` narrows it, the default shows `info` and up.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // the subscriber installs even though `log` already has env_logger
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    log::warn!("condition not met within {limit:?}");
    condition()
}

fn injected(host: &str) -> SyncError {
    SyncError::Transient(TransportError::Connect { host: host.to_string(), reason: "injected failure".into() })
}

// --- enforcement -----------------------------------------------------------

#[derive(Debug, Default)]
struct EnforcerState {
    blocked: BTreeSet<(String, String)>,
    calls: Vec<String>,
    failures: u32,
    closed: bool,
}

/// Test-side view of a [`RecordingEnforcer`].
#[derive(Clone, Default)]
pub struct EnforcerLog {
    state: Arc<Mutex<EnforcerState>>,
}

impl EnforcerLog {
    /// Currently blocked `(enforcer, peer)` flows.
    pub fn blocked(&self) -> BTreeSet<(String, String)> {
        self.state.lock().blocked.clone()
    }

    /// `block a->b` / `unblock a->b`, in call order, failed ones included.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// The next `n` block/unblock calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures = n;
    }

    /// Pretend a previous run left this flow blocked.
    pub fn preload(&self, enforcer: &str, peer: &str) {
        self.state.lock().blocked.insert((enforcer.to_string(), peer.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

pub struct RecordingEnforcer {
    kind: BackendKind,
    log: EnforcerLog,
}

impl RecordingEnforcer {
    pub fn new(kind: BackendKind) -> (Self, EnforcerLog) {
        let log = EnforcerLog::default();
        (Self { kind, log: log.clone() }, log)
    }

    fn apply(&self, target: &EnforcementTarget, block: bool) -> Result<Outcome, SyncError> {
        let mut state = self.log.state.lock();
        let verb = if block { "block" } else { "unblock" };
        state.calls.push(format!("{verb} {}->{}", target.enforcer, target.peer));
        if state.failures > 0 {
            state.failures -= 1;
            return Err(injected(&target.endpoint.host.to_string()));
        }
        let flow = (target.enforcer.clone(), target.peer.clone());
        let was = state.blocked.contains(&flow);
        if block {
            state.blocked.insert(flow);
        } else {
            state.blocked.remove(&flow);
        }
        log::info!("[{}] {verb} {}->{}", self.kind, target.enforcer, target.peer);
        Ok(Outcome { changed: was != block, before: describe(was), after: describe(block) })
    }
}

fn describe(blocked: bool) -> String {
    if blocked { "blocked" } else { "open" }.to_string()
}

#[async_trait]
impl EnforcementBackend for RecordingEnforcer {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn is_blocked(&mut self, target: &EnforcementTarget) -> Result<bool, SyncError> {
        let flow = (target.enforcer.clone(), target.peer.clone());
        Ok(self.log.state.lock().blocked.contains(&flow))
    }

    async fn block(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        self.apply(target, true)
    }

    async fn unblock(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        self.apply(target, false)
    }

    async fn close(&mut self) {
        self.log.state.lock().closed = true;
    }
}

// --- power -----------------------------------------------------------------

#[derive(Debug, Default)]
struct PowerState {
    nodes: BTreeMap<String, String>,
    calls: Vec<String>,
    failures: u32,
}

/// Test-side view of a [`RecordingPower`]. Unknown nodes read as `started`.
#[derive(Clone, Default)]
pub struct PowerLog {
    state: Arc<Mutex<PowerState>>,
}

impl PowerLog {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn set_state(&self, node: &str, status: &str) {
        self.state.lock().nodes.insert(node.to_string(), status.to_string());
    }

    pub fn state(&self, node: &str) -> Option<String> {
        self.state.lock().nodes.get(node).cloned()
    }

    /// The next `n` start/stop calls fail.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures = n;
    }
}

pub struct RecordingPower {
    log: PowerLog,
}

impl RecordingPower {
    pub fn new() -> (Self, PowerLog) {
        let log = PowerLog::default();
        (Self { log: log.clone() }, log)
    }

    fn transition(&self, node: &str, verb: &str, status: &str) -> Result<(), SyncError> {
        let mut state = self.log.state.lock();
        state.calls.push(format!("{verb} {node}"));
        if state.failures > 0 {
            state.failures -= 1;
            return Err(SyncError::OrchestratorApi {
                method: "POST",
                url: format!("http://orchestrator.test/nodes/{node}/{verb}"),
                status: "503 Service Unavailable".into(),
                body: String::new(),
            });
        }
        state.nodes.insert(node.to_string(), status.to_string());
        Ok(())
    }
}

#[async_trait]
impl PowerBackend for RecordingPower {
    async fn start(&mut self, node: &str) -> Result<(), SyncError> {
        self.transition(node, "start", "started")
    }

    async fn stop(&mut self, node: &str) -> Result<(), SyncError> {
        self.transition(node, "stop", "stopped")
    }

    async fn get_state(&mut self, node: &str) -> Result<NodeState, SyncError> {
        let status = self.log.state(node).unwrap_or_else(|| "started".to_string());
        Ok(NodeState { node: node.to_string(), status })
    }
}

// --- links -----------------------------------------------------------------

#[derive(Debug, Default)]
struct LinkState {
    /// link id -> (node, node, suspended)
    links: BTreeMap<String, (String, String, bool)>,
    calls: Vec<String>,
    failures: u32,
}

/// Test-side view of a [`RecordingLinks`].
#[derive(Clone, Default)]
pub struct LinkLog {
    state: Arc<Mutex<LinkState>>,
}

impl LinkLog {
    pub fn add_link(&self, id: &str, a: &str, b: &str) {
        self.state.lock().links.insert(id.to_string(), (a.to_string(), b.to_string(), false));
    }

    /// Mark a link suspended without a call, as a previous run would leave it.
    pub fn preload_suspended(&self, id: &str) {
        if let Some(link) = self.state.lock().links.get_mut(id) {
            link.2 = true;
        }
    }

    pub fn suspended(&self) -> BTreeSet<String> {
        self.state.lock().links.iter().filter(|(_, l)| l.2).map(|(id, _)| id.clone()).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// The next `n` calls of either kind fail.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures = n;
    }
}

pub struct RecordingLinks {
    log: LinkLog,
}

impl RecordingLinks {
    pub fn new() -> (Self, LinkLog) {
        let log = LinkLog::default();
        (Self { log: log.clone() }, log)
    }

    fn record(state: &mut LinkState, call: String) -> Result<(), SyncError> {
        state.calls.push(call);
        if state.failures > 0 {
            state.failures -= 1;
            return Err(SyncError::OrchestratorApi {
                method: "GET",
                url: "http://orchestrator.test/links".into(),
                status: "503 Service Unavailable".into(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LinkBackend for RecordingLinks {
    async fn links_between(&mut self, a: &str, b: &str) -> Result<Vec<LinkInfo>, SyncError> {
        let mut state = self.log.state.lock();
        Self::record(&mut state, format!("links {a} {b}"))?;
        let found = state
            .links
            .iter()
            .filter(|(_, (x, y, _))| (x == a && y == b) || (x == b && y == a))
            .map(|(id, (_, _, suspended))| LinkInfo { id: id.clone(), suspended: *suspended })
            .collect();
        Ok(found)
    }

    async fn set_suspended(&mut self, link: &str, suspend: bool) -> Result<(), SyncError> {
        let mut state = self.log.state.lock();
        let verb = if suspend { "suspend" } else { "resume" };
        Self::record(&mut state, format!("{verb} {link}"))?;
        if let Some(entry) = state.links.get_mut(link) {
            entry.2 = suspend;
        }
        Ok(())
    }
}

// --- reachability ----------------------------------------------------------

/// Every address answers unless told otherwise.
#[derive(Clone, Default)]
pub struct ScriptedReachability {
    answers: Arc<Mutex<HashMap<IpAddr, bool>>>,
    probes: Arc<Mutex<Vec<(IpAddr, Option<IpAddr>)>>>,
}

impl ScriptedReachability {
    pub fn set(&self, addr: IpAddr, reachable: bool) {
        self.answers.lock().insert(addr, reachable);
    }

    /// `(target, source)` of every probe so far.
    pub fn probes(&self) -> Vec<(IpAddr, Option<IpAddr>)> {
        self.probes.lock().clone()
    }
}

#[async_trait]
impl Reachability for ScriptedReachability {
    async fn reachable(&self, addr: IpAddr, bind: Option<IpAddr>) -> bool {
        self.probes.lock().push((addr, bind));
        self.answers.lock().get(&addr).copied().unwrap_or(true)
    }
}

// --- liveness checks -------------------------------------------------------

#[derive(Debug, Default)]
struct CheckState {
    defaults: HashMap<String, bool>,
    queued: HashMap<String, VecDeque<Option<bool>>>,
    stall: Option<Duration>,
    calls: Vec<String>,
    ticks: u32,
    closed: bool,
}

/// Test-side script for a [`ScriptedCheck`]. Peers answer `true` by default.
#[derive(Clone, Default)]
pub struct CheckScript {
    state: Arc<Mutex<CheckState>>,
}

impl CheckScript {
    /// Answer for `peer` once its queue is empty.
    pub fn set(&self, peer: &str, alive: bool) {
        self.state.lock().defaults.insert(peer.to_string(), alive);
    }

    /// Queue one answer for `peer`.
    pub fn push(&self, peer: &str, alive: bool) {
        self.state.lock().queued.entry(peer.to_string()).or_default().push_back(Some(alive));
    }

    /// Queue one transport error for `peer`.
    pub fn push_error(&self, peer: &str) {
        self.state.lock().queued.entry(peer.to_string()).or_default().push_back(None);
    }

    /// Every check sleeps this long before answering.
    pub fn stall(&self, delay: Option<Duration>) {
        self.state.lock().stall = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, peer: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == peer).count()
    }

    pub fn ticks(&self) -> u32 {
        self.state.lock().ticks
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

pub struct ScriptedCheck {
    kind: &'static str,
    script: CheckScript,
}

impl ScriptedCheck {
    pub fn new(kind: &'static str) -> (Self, CheckScript) {
        let script = CheckScript::default();
        (Self { kind, script: script.clone() }, script)
    }
}

#[async_trait]
impl LivenessCheck for ScriptedCheck {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn begin_tick(&mut self) {
        self.script.state.lock().ticks += 1;
    }

    async fn check(&mut self, peer: &PeerTarget) -> Result<bool, SyncError> {
        let stall = {
            let mut state = self.script.state.lock();
            state.calls.push(peer.name.clone());
            state.stall
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.script.state.lock();
        let queued = state.queued.get_mut(&peer.name).and_then(VecDeque::pop_front);
        match queued {
            Some(Some(alive)) => Ok(alive),
            Some(None) => Err(injected(&peer.address.to_string())),
            None => Ok(state.defaults.get(&peer.name).copied().unwrap_or(true)),
        }
    }

    async fn close(&mut self) {
        self.script.state.lock().closed = true;
    }
}
