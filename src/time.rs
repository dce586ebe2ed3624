//! Wall-clock abstraction used for entry expiration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait TimeService: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn wall_clock_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn wall_clock_ms(&self) -> u64 {
        now_ms()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ControlledTimeService {
    now: AtomicU64,
}

impl ControlledTimeService {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(now_ms()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ControlledTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeService for ControlledTimeService {
    fn wall_clock_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
