use std::sync::atomic::{AtomicU64, Ordering};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Current unix time in milliseconds.
    fn now_unix_ms(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        crate::system_unix_ms()
    }
}

/// A clock that only moves when told to. Useful for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at `unix_ms`.
    pub fn new(unix_ms: u64) -> Self {
        Self { now: AtomicU64::new(unix_ms) }
    }

    /// Jump to `unix_ms` (forwards or backwards).
    pub fn set(&self, unix_ms: u64) {
        self.now.store(unix_ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
