//! Capped exponential backoff for session establishment

use crate::error::TransportError;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10), 5)
    }
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { initial, max: max.max(initial), max_attempts: max_attempts.max(1) }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Delays slept between consecutive attempts (one fewer than attempts).
    pub fn schedule(&self) -> Vec<Duration> {
        let mut b = self.backoff();
        // randomization is off, but the crate still adds up to a nanosecond of jitter
        (1..self.max_attempts)
            .map_while(|_| b.next_backoff())
            .map(|d| Duration::from_millis(d.as_millis() as u64).min(self.max))
            .collect()
    }

    /// Longest a full run can take when every attempt uses up `per_attempt`.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        per_attempt * self.max_attempts + self.schedule().into_iter().sum::<Duration>()
    }
}

/// Something that can try to (re)establish itself once.
#[async_trait]
pub trait Reconnect: Send {
    async fn attempt(&mut self) -> Result<(), TransportError>;
    fn describe(&self) -> String;
}

/// Try `target` up to `policy.max_attempts` times, sleeping the backoff
/// delay between attempts. Returns the last error wrapped in `Exhausted`.
pub async fn reconnect_with_backoff<T>(target: &mut T, policy: &ReconnectPolicy) -> Result<(), TransportError>
where
    T: Reconnect + ?Sized,
{
    let mut delays = policy.schedule().into_iter();
    let mut attempt = 1;
    loop {
        match target.attempt().await {
            Ok(()) => {
                if attempt > 1 {
                    debug!(target = %target.describe(), attempt, "reconnected");
                }
                return Ok(());
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        target = %target.describe(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "connection attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    return Err(TransportError::Exhausted {
                        target: target.describe(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
            },
        }
    }
}
