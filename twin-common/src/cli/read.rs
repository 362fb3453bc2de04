// Bounded read-with-deadline over a CLI channel

use super::tokens::TokenTable;
use super::CliChannel;
use crate::error::TransportError;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// `quiet` only starts counting once the first byte arrived; before that the
/// read waits up to `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub quiet: Duration,
    pub deadline: Duration,
}

impl ReadWindow {
    pub fn new(quiet: Duration, deadline: Duration) -> Self {
        Self { quiet, deadline }
    }

    /// No quiescence: wait for the marker, close, or the deadline.
    pub fn until_marker(deadline: Duration) -> Self {
        Self { quiet: deadline, deadline }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Marker(&'static str),
    Quiescent,
    Deadline,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub text: String,
    pub end: ReadEnd,
}

impl Capture {
    pub fn timed_out(&self) -> bool {
        self.end == ReadEnd::Deadline
    }
}

pub async fn read_until<C>(chan: &mut C, window: ReadWindow, marker: Option<&TokenTable>) -> Result<Capture, TransportError>
where
    C: CliChannel + ?Sized,
{
    let hard = Instant::now() + window.deadline;
    let mut text = String::new();
    loop {
        let now = Instant::now();
        if now >= hard {
            return Ok(Capture { text, end: ReadEnd::Deadline });
        }
        let wait_until = if text.is_empty() { hard } else { hard.min(now + window.quiet) };
        match timeout_at(wait_until, chan.recv()).await {
            Ok(Ok(Some(chunk))) => {
                text.push_str(&String::from_utf8_lossy(&chunk));
                if let Some(token) = marker.and_then(|m| m.scan(&text).token()) {
                    return Ok(Capture { text, end: ReadEnd::Marker(token) });
                }
            }
            Ok(Ok(None)) => return Ok(Capture { text, end: ReadEnd::Closed }),
            Ok(Err(e)) => return Err(e),
            Err(_) if wait_until < hard => return Ok(Capture { text, end: ReadEnd::Quiescent }),
            Err(_) => return Ok(Capture { text, end: ReadEnd::Deadline }),
        }
    }
}
