//! Debounce / hysteresis state machine
//!
//! One tracker per observed thing (device, peer, reported direction). The
//! settled state only moves after `fail` consecutive failures or `recover`
//! consecutive successes; any disagreeing observation resets the streak.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettledState {
    Unknown,
    Up,
    Down,
}

impl fmt::Display for SettledState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettledState::Unknown => "UNKNOWN",
            SettledState::Up => "UP",
            SettledState::Down => "DOWN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub fail: u32,
    pub recover: u32,
}

impl Thresholds {
    /// Zero thresholds are clamped to 1.
    pub fn new(fail: u32, recover: u32) -> Self {
        Self { fail: fail.max(1), recover: recover.max(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: SettledState,
    pub to: SettledState,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebounceTracker {
    thresholds: Thresholds,
    successes: u32,
    failures: u32,
    state: SettledState,
}

impl DebounceTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self::with_state(thresholds, SettledState::Unknown)
    }

    pub fn with_state(thresholds: Thresholds, state: SettledState) -> Self {
        Self { thresholds, successes: 0, failures: 0, state }
    }

    pub fn state(&self) -> SettledState {
        self.state
    }

    pub fn is_down(&self) -> bool {
        self.state == SettledState::Down
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.successes, self.failures)
    }

    pub fn update(&mut self, ok: bool) -> Option<Transition> {
        let (streak, threshold, target) = if ok {
            self.failures = 0;
            self.successes = self.successes.saturating_add(1);
            (self.successes, self.thresholds.recover, SettledState::Up)
        } else {
            self.successes = 0;
            self.failures = self.failures.saturating_add(1);
            (self.failures, self.thresholds.fail, SettledState::Down)
        };

        if streak < threshold || self.state == target {
            return None;
        }
        let transition = Transition { from: self.state, to: target };
        self.state = target;
        self.successes = 0;
        self.failures = 0;
        Some(transition)
    }
}
