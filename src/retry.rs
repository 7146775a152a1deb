//! Retry policy with exponential backoff
//!
//! The dispatcher asks [`RetryPolicy::decide`] after every failed SMTP submission. The
//! signal listener walks the same delay curve through [`Backoff`], without a limit.

use crate::error::SendError;
use std::time::Duration;

/// Largest share of a delay added on top as jitter
const JITTER_FRACTION: f64 = 0.25;

/// Backoff and attempt limits
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,

    /// Wait before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for the wait before jitter
    pub max_backoff: Duration,

    pub multiplier: f64,

    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Bus reconnects: 1s, 2s, 4s, ... capped at 60s, never gives up
    pub fn reconnect() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// SMTP submissions with a custom attempt limit
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Wait before the next attempt once `failed` attempts have failed.
    ///
    /// The first retry waits `initial_backoff`, each later one `multiplier` times longer,
    /// up to `max_backoff`. Jitter then adds up to a quarter on top.
    pub fn delay_after(&self, failed: u32) -> Duration {
        let steps = failed.saturating_sub(1).min(64) as i32;
        let ceiling = self.max_backoff.as_secs_f64();
        let secs = (self.initial_backoff.as_secs_f64() * self.multiplier.powi(steps)).min(ceiling);

        let spread = if self.jitter {
            rand::random::<f64>() * JITTER_FRACTION
        } else {
            0.0
        };
        Duration::from_secs_f64(secs * (1.0 + spread))
    }

    /// What to do after `failed` attempts, the last one failing with `error`
    pub fn decide<E: RetryableError>(&self, failed: u32, error: &E) -> RetryDecision {
        if error.is_retryable() && failed < self.max_attempts {
            RetryDecision::RetryAfter(self.delay_after(failed))
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Errors that know whether another attempt can succeed
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for SendError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Delay curve for loops that retry indefinitely
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before trying again
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_after(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
