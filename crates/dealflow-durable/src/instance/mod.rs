//! Instance data model
//!
//! An instance exclusively owns its log entries, step records, pending
//! timers and pending waits; everything here is persisted through the
//! [`InstanceStore`](crate::persistence::InstanceStore).

mod log;
mod step;

pub use log::{LogEntry, LogEntryKind};
pub use step::{StepKey, StepRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepFailure;

/// Lifecycle status of an instance
///
/// Terminal statuses are monotone: once entered they are never left.
/// `DeadLettered` is the sub-state of `Failed` an operator parks an
/// instance in for later retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

impl InstanceStatus {
    /// Whether the instance can still make progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::DeadLettered
        )
    }

    /// Whether the instance counts as active for stuck detection
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Suspended)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// Materialised state of an instance
///
/// This is the projection of the event log into a record compact enough to
/// answer status queries without replay. Replaying the log from ordinal 0
/// must reconstruct the `state`/`status`/`output` fields exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: Uuid,

    /// Workflow kind identifier
    pub kind: String,

    /// Definition version captured at creation; resumes use this version
    pub version: String,

    pub status: InstanceStatus,

    /// Current state name within the definition
    pub state: String,

    /// State-visit sequence, bumped on every transition. Step ordinals are
    /// namespaced by this so a revisited state never observes memoized
    /// results from an earlier visit.
    pub visit: u32,

    /// Input payload, immutable after creation
    pub input: serde_json::Value,

    /// Output payload, written once on the terminal transition
    pub output: Option<serde_json::Value>,

    /// Failure recorded when the instance failed
    pub failure: Option<StepFailure>,

    /// Set when cancellation has been requested but not yet observed
    pub cancel_requested: Option<String>,

    /// Failure injected by a timeout or operator, consumed at next resume
    pub pending_failure: Option<StepFailure>,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Fresh record in the definition's initial state
    pub fn new(
        id: Uuid,
        kind: impl Into<String>,
        version: impl Into<String>,
        initial_state: impl Into<String>,
        input: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            version: version.into(),
            status: InstanceStatus::Running,
            state: initial_state.into(),
            visit: 0,
            input,
            output: None,
            failure: None,
            cancel_requested: None,
            pending_failure: None,
            created_at: at,
            last_activity_at: at,
        }
    }
}

/// Why a pending timer exists
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerPurpose {
    /// A durable `sleep` inside a handler
    Sleep { step: StepKey },

    /// Backoff delay before the next attempt of a step
    Retry { step: StepKey },

    /// Deadline attached to a pending wait
    WaitDeadline { wait_id: Uuid },

    /// Per-state timeout; `then` is the state entered on expiry
    StateTimeout { state: String, then: String },

    /// Whole-instance timeout; `then` is the state entered on expiry,
    /// `None` fails the instance with a timeout
    OverallTimeout { then: Option<String> },
}

impl TimerPurpose {
    /// Short tag for logs and the timer table
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sleep { .. } => "sleep",
            Self::Retry { .. } => "retry",
            Self::WaitDeadline { .. } => "wait_deadline",
            Self::StateTimeout { .. } => "state_timeout",
            Self::OverallTimeout { .. } => "overall_timeout",
        }
    }
}

/// A scheduled wake-up
///
/// Fires at most once: the dispatcher removes the row before acting, so
/// at-least-once pump delivery collapses to exactly-once handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTimer {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub fire_at: DateTime<Utc>,
    pub purpose: TimerPurpose,
}

/// Approval metadata carried by waits created through `wait_for_approval`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub reviewers: Vec<String>,
    pub scope: String,
}

/// A registered wait for an external event
///
/// Exactly one matching published event consumes a wait; consumption
/// completes the owning step record in the same store transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWait {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub event_name: String,
    pub correlation_key: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    /// Step record completed when the wait resolves
    pub step: StepKey,
    /// Present when the wait was registered by `wait_for_approval`
    pub approval: Option<ApprovalRequest>,
    pub registered_at: DateTime<Utc>,
}

impl PendingWait {
    /// Whether a published event addresses this wait
    ///
    /// A wait without a correlation key accepts any event of the name; a
    /// keyed wait only accepts the matching key.
    pub fn matches(&self, event_name: &str, correlation_key: Option<&str>) -> bool {
        self.event_name == event_name
            && match &self.correlation_key {
                Some(key) => correlation_key == Some(key.as_str()),
                None => true,
            }
    }
}

/// An event published before any matching wait existed, held for late
/// subscribers until its TTL expires
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub name: String,
    pub correlation_key: Option<String>,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Point-in-time copy of an instance, usable to fork a new one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub label: String,
    pub taken_at: DateTime<Utc>,
    /// Log length at snapshot time
    pub log_head: u64,
    pub record: InstanceRecord,
    pub log: Vec<LogEntry>,
    pub steps: Vec<StepRecord>,
}

/// Listing view of a snapshot without the blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub label: String,
    pub taken_at: DateTime<Utc>,
    pub log_head: u64,
}

impl From<&Snapshot> for SnapshotInfo {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id,
            instance_id: snapshot.instance_id,
            label: snapshot.label.clone(),
            taken_at: snapshot.taken_at,
            log_head: snapshot.log_head,
        }
    }
}

/// A failed instance parked for operator action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub last_state: String,
    pub retry_count: u32,
    pub payload: serde_json::Value,
}

/// Exclusive execution right held by a dispatcher worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub worker: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-instance resource counters
///
/// Accumulated across resumes; threshold violations emit non-fatal
/// warnings through `tracing`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    pub steps_executed: u64,
    pub retries: u64,
    pub events_consumed: u64,
    pub external_calls: u64,
    pub store_reads: u64,
    pub store_writes: u64,
    pub busy_ms: u64,
}

impl ResourceUsage {
    /// Merge another usage delta into this one
    pub fn absorb(&mut self, other: &ResourceUsage) {
        self.steps_executed += other.steps_executed;
        self.retries += other.retries;
        self.events_consumed += other.events_consumed;
        self.external_calls += other.external_calls;
        self.store_reads += other.store_reads;
        self.store_writes += other.store_writes;
        self.busy_ms += other.busy_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::DeadLettered.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
        assert!(InstanceStatus::Suspended.is_active());
    }

    #[test]
    fn wait_matching_respects_correlation() {
        let wait = PendingWait {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            event_name: "payment_received".into(),
            correlation_key: Some("deal-7".into()),
            deadline: None,
            step: StepKey::new("wait:payment_received", 0),
            approval: None,
            registered_at: Utc::now(),
        };

        assert!(wait.matches("payment_received", Some("deal-7")));
        assert!(!wait.matches("payment_received", Some("deal-8")));
        assert!(!wait.matches("payment_received", None));
        assert!(!wait.matches("funds_released", Some("deal-7")));
    }

    #[test]
    fn unkeyed_wait_accepts_any_correlation() {
        let wait = PendingWait {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            event_name: "qualify".into(),
            correlation_key: None,
            deadline: None,
            step: StepKey::new("wait:qualify", 0),
            approval: None,
            registered_at: Utc::now(),
        };

        assert!(wait.matches("qualify", None));
        assert!(wait.matches("qualify", Some("anything")));
    }

    #[test]
    fn usage_absorb_sums_counters() {
        let mut usage = ResourceUsage {
            steps_executed: 2,
            ..Default::default()
        };
        usage.absorb(&ResourceUsage {
            steps_executed: 3,
            external_calls: 1,
            ..Default::default()
        });

        assert_eq!(usage.steps_executed, 5);
        assert_eq!(usage.external_calls, 1);
    }
}
