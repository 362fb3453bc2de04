use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BusView {
    pub status: String,
    pub reconnects: u32,
    pub uptime_seconds: u64,
}

/// Connection state of the coordinator's bus subscription.
#[derive(Clone)]
pub struct BusHealth {
    start_time: Instant,
    reconnects: Arc<AtomicU32>,
    status: Arc<Mutex<String>>,
}

impl Default for BusHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl BusHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconnects: Arc::new(AtomicU32::new(0)),
            status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_connected(&self) {
        *self.status.lock() = "connected".to_string();
    }

    pub fn mark_disconnected(&self) {
        *self.status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        *self.status.lock() = "reconnecting".to_string();
    }

    pub fn view(&self) -> BusView {
        BusView {
            status: self.status.lock().clone(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnects_are_counted() {
        let health = BusHealth::new();
        assert_eq!(health.view().status, "connecting");
        health.increment_reconnects();
        health.increment_reconnects();
        assert_eq!(health.view().reconnects, 2);
        assert_eq!(health.view().status, "reconnecting");
        health.clone().mark_connected();
        assert_eq!(health.view().status, "connected");
    }
}
