//! Retry budget for failed sync rounds
//!
//! Exponential backoff: `base * 2^retry`, capped at the configured maximum.
//! The budget resets after any successful round.

use crate::config::SyncConfig;
use std::time::Duration;

/// What to do after a failed round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay
    RetryAfter(Duration),
    /// The budget is spent
    GiveUp,
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed rounds tolerated before giving up
    pub max_retries: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy from sync configuration
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry number `retry` (zero-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry);
        self.initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retry counter driven by round outcomes
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    retry_count: u32,
}

impl RetryState {
    /// Fresh budget
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_count: 0,
        }
    }

    /// Consecutive failures so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether the budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.retry_count > self.policy.max_retries
    }

    /// Record a failed round
    pub fn record_failure(&mut self) -> RetryDecision {
        let delay = self.policy.calculate_delay(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        if self.is_exhausted() {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(delay)
        }
    }

    /// Record a successful round
    pub fn record_success(&mut self) {
        self.retry_count = 0;
    }
}
