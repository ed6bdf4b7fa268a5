//! Runtime-aware wall clock

use roomstate_core::PhysicalClock;
use roomstate_core::SystemClock;
use tokio::time::Instant;

/// Wall clock that advances with the tokio timer.
///
/// Reads the system clock once at construction and then adds elapsed tokio
/// time, so timestamps stay consistent with `tokio::time::sleep` deadlines
/// (including under a paused test runtime).
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
    wall_base_ms: u64,
}

impl TokioClock {
    /// Clock anchored at the current system time
    pub fn new() -> Self {
        Self::with_base(SystemClock.now_ms())
    }

    /// Clock anchored at `wall_base_ms`
    pub fn with_base(wall_base_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            wall_base_ms,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalClock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.wall_base_ms + self.origin.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = TokioClock::with_base(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_250);
    }
}
