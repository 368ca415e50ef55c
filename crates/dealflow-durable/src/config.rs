//! Engine configuration surface

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::RetryPolicy;
use crate::serde_util::{duration_millis, option_duration_millis};

/// Tunables for the engine
///
/// Every knob has a production-sensible default; tests typically only touch
/// `worker_count` and the retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default retry attempts for steps that do not set their own policy
    pub max_retries: u32,

    /// Default delay before the first retry
    #[serde(with = "duration_millis")]
    pub default_initial_backoff: Duration,

    /// Default backoff multiplier between retries
    pub default_backoff_multiplier: f64,

    /// Default cap on the retry delay
    #[serde(with = "duration_millis")]
    pub default_max_backoff: Duration,

    /// Overall timeout applied to instances whose definition sets none
    #[serde(with = "option_duration_millis")]
    pub instance_overall_timeout: Option<Duration>,

    /// Exclusive execution lease held by a dispatcher worker
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Dispatcher worker tasks
    pub worker_count: usize,

    /// An active instance with no log activity for this long is "stuck"
    #[serde(with = "duration_millis")]
    pub stuck_threshold: Duration,

    /// Retention for terminal instances before purge
    #[serde(with = "duration_millis")]
    pub instance_retention: Duration,

    /// Retention for dead-letter entries
    #[serde(with = "duration_millis")]
    pub dlq_retention: Duration,

    /// Retention for snapshots
    #[serde(with = "duration_millis")]
    pub snapshot_retention: Duration,

    /// Bound on the per-name queue of events published before any wait
    pub max_queued_events_per_name: usize,

    /// How long a queued event stays deliverable to a late wait
    #[serde(with = "duration_millis")]
    pub queued_event_ttl: Duration,

    /// Panics tolerated per step before the record is quarantined
    pub max_panics: u32,

    /// Timer pump interval; timers firing within the same tick may coalesce
    #[serde(with = "duration_millis")]
    pub timer_resolution: Duration,

    /// Safety bound on log length per instance
    pub max_log_entries: usize,

    /// Safety bound on state transitions within a single resume
    pub max_transitions_per_resume: u32,

    /// Busy-time threshold above which a resource warning is emitted
    #[serde(with = "duration_millis")]
    pub warn_busy_threshold: Duration,

    /// External-call count threshold for resource warnings
    pub warn_external_calls: u64,

    /// Store-operation count threshold for resource warnings
    pub warn_store_ops: u64,

    /// Permit the migration-only fast-forward path
    pub allow_fast_forward: bool,

    /// Permit the auto-approve recovery action on stuck instances
    pub allow_auto_approve: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            default_initial_backoff: Duration::from_secs(1),
            default_backoff_multiplier: 2.0,
            default_max_backoff: Duration::from_secs(60),
            instance_overall_timeout: None,
            lease_duration: Duration::from_secs(30),
            worker_count: 4,
            stuck_threshold: Duration::from_secs(600),
            instance_retention: Duration::from_secs(30 * 24 * 3600),
            dlq_retention: Duration::from_secs(30 * 24 * 3600),
            snapshot_retention: Duration::from_secs(30 * 24 * 3600),
            max_queued_events_per_name: 1000,
            queued_event_ttl: Duration::from_secs(24 * 3600),
            max_panics: 3,
            timer_resolution: Duration::from_millis(250),
            max_log_entries: 10_000,
            max_transitions_per_resume: 256,
            warn_busy_threshold: Duration::from_secs(30),
            warn_external_calls: 1000,
            warn_store_ops: 10_000,
            allow_fast_forward: false,
            allow_auto_approve: false,
        }
    }
}

impl EngineConfig {
    /// Set the default retry attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the worker count
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the lease duration
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the stuck-instance threshold
    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    /// Set the overall instance timeout default
    pub fn with_instance_overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.instance_overall_timeout = timeout;
        self
    }

    /// Set the per-name queued-event bound
    pub fn with_max_queued_events(mut self, max: usize) -> Self {
        self.max_queued_events_per_name = max.max(1);
        self
    }

    /// Allow the migration fast-forward path
    pub fn with_fast_forward(mut self, allow: bool) -> Self {
        self.allow_fast_forward = allow;
        self
    }

    /// Allow the auto-approve recovery action
    pub fn with_auto_approve(mut self, allow: bool) -> Self {
        self.allow_auto_approve = allow;
        self
    }

    /// Retry policy assembled from the configured defaults
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_initial_backoff(self.default_initial_backoff)
            .with_backoff_multiplier(self.default_backoff_multiplier)
            .with_max_backoff(self.default_max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_queued_events_per_name, 1000);
        assert_eq!(config.max_panics, 3);
        assert!(!config.allow_fast_forward);
    }

    #[test]
    fn builder_methods_apply() {
        let config = EngineConfig::default()
            .with_worker_count(0)
            .with_max_retries(2)
            .with_fast_forward(true);

        // Worker count is clamped to at least one
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.max_retries, 2);
        assert!(config.allow_fast_forward);
    }

    #[test]
    fn default_retry_policy_reflects_config() {
        let config = EngineConfig::default().with_max_retries(3);
        let policy = config.default_retry_policy();
        assert_eq!(policy.max_attempts, 3);
    }
}
