//! Wall-clock time effect
//!
//! Timestamps on states, updates and snapshots are milliseconds since the
//! UNIX epoch. The engine reads the clock only through [`PhysicalClock`] so
//! tests can drive time explicitly.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock timestamps
pub trait PhysicalClock: Send + Sync {
    /// Current time in milliseconds since the UNIX epoch
    fn now_ms(&self) -> u64;
}

/// Operating system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl<C: PhysicalClock + ?Sized> PhysicalClock for std::sync::Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}
