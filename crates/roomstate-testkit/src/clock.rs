//! Manually driven wall clock

use roomstate_core::PhysicalClock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Clock that only moves when told to.
///
/// Suits the engine components driven directly (synchronizer, manager,
/// resolver). Sessions should use `TokioClock` under a paused runtime so the
/// session timers and timestamps agree.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Clock reading `start_ms`
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) -> u64 {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst) + by.as_millis() as u64
    }

    /// Jump to `ms`
    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.advance(Duration::from_millis(250)), 1_250);
        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }
}
