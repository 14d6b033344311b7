//! Time as a capability, not a global (spec §9: "process-wide logging and
//! time... treat as capabilities passed through the engine's configuration").
//!
//! Production code drives everything through [`SystemClock`]. Tests that
//! need to exercise hour-scale backoff schedules (spec P5, the mDNS query
//! backoff cap) use [`VirtualClock`] instead of sleeping wall-clock time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A monotonic source of "now", injectable so tests can fast-forward.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since an arbitrary but fixed epoch for this clock
    /// instance. Only deltas between two calls are meaningful.
    fn now_millis(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// Wall-clock time via `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A manually-advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    millis: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.millis.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Shared, type-erased clock handle threaded through every component.
pub type SharedClock = Arc<dyn Clock>;
