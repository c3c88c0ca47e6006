//! Retry policy for queued mutations.
//!
//! A drain never loops on a failing mutation. Each transient failure pushes the
//! mutation's next eligible attempt into the future; once `max_attempts`
//! failures have accumulated the mutation is reported as stuck and left for a
//! manual retry.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay after every failure.
    Fixed,
    /// base * 2^(failures - 1)
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which a mutation is considered stuck.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Retry on every trigger, no backoff, up to `max_attempts`.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before the next attempt after `failures` failed attempts.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay.min(self.max_delay),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow((failures - 1).min(20));
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// When the mutation becomes eligible again, or `None` if the budget is spent.
    pub fn next_attempt_at(&self, failures: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.should_retry(failures) {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay_after(failures)).unwrap_or_default();
        Some(now + delay)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}
