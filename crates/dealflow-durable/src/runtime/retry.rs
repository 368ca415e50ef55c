//! Per-step retry policy
//!
//! Exponential backoff with jitter. `retry_on` enumerates the error kinds
//! treated as transient; any other kind terminates the step immediately.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::serde_util::duration_millis;

/// Retry configuration for a step
///
/// # Example
///
/// ```
/// use dealflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3)
///     .with_initial_backoff(Duration::from_secs(1))
///     .with_max_backoff(Duration::from_secs(30));
///
/// // First retry after ~1s, second after ~2s, then the budget is gone.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,

    /// Multiplier applied per retry
    pub backoff_multiplier: f64,

    /// Cap on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Jitter factor (0.0–1.0) applied to each delay
    pub jitter: f64,

    /// Error kinds considered transient
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_retry_on() -> Vec<ErrorKind> {
    vec![ErrorKind::Transient]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RetryPolicy {
    /// Exponential policy with the given attempt budget
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter: 0.1,
            retry_on: default_retry_on(),
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
            retry_on: vec![],
        }
    }

    /// Fixed-interval retries
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: interval,
            backoff_multiplier: 1.0,
            max_backoff: interval,
            jitter: 0.0,
            retry_on: default_retry_on(),
        }
    }

    /// Set the initial backoff
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the backoff cap
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the jitter factor (clamped to 0.0–1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Replace the set of retryable error kinds
    pub fn with_retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Whether a failure of this kind is retryable under the policy
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Whether any attempts remain after `attempts` have been made
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Backoff before the retry following the given completed attempt
    /// (1-based)
    pub fn backoff_for(&self, completed_attempt: u32) -> Duration {
        if completed_attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(completed_attempt as i32 - 1);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}
