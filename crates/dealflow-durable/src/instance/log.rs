//! Append-only event log
//!
//! Entries are immutable once written and are only removed by explicit
//! retention purges. Replaying an instance's log from ordinal 0
//! reconstructs its materialised state exactly; the debug surface leans on
//! this for time travel and divergence checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::StepKey;
use super::InstanceStatus;
use crate::error::StepFailure;

/// One entry in an instance's log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Monotonically increasing per instance, starting at 0
    pub ordinal: u64,
    pub at: DateTime<Utc>,
    pub kind: LogEntryKind,
}

/// What happened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntryKind {
    /// A step body is about to run for the given attempt
    StepStarted { step: StepKey, attempt: u32 },

    /// A step recorded its memoized output
    StepCompleted {
        step: StepKey,
        result: serde_json::Value,
    },

    /// A step recorded a terminal failure
    StepFailed { step: StepKey, failure: StepFailure },

    /// A retry was scheduled after a transient failure
    Retry {
        step: StepKey,
        attempt: u32,
        backoff_ms: u64,
    },

    /// A durable sleep began
    SleepStarted {
        timer_id: Uuid,
        duration_ms: u64,
        purpose: String,
    },

    /// A timer fired (sleep elapsed, retry due, or deadline reached)
    SleepFired { timer_id: Uuid },

    /// A wait for an external event was registered
    EventAwaited {
        wait_id: Uuid,
        event: String,
        correlation_key: Option<String>,
        deadline: Option<DateTime<Utc>>,
    },

    /// A published event was consumed by a wait; the payload is frozen
    /// here and never re-read from the outside world
    EventArrived {
        wait_id: Uuid,
        event: String,
        correlation_key: Option<String>,
        payload: serde_json::Value,
    },

    /// The instance moved between states
    StateTransition { from: Option<String>, to: String },

    /// An uncaught failure was raised against the instance
    ErrorRaised { failure: StepFailure },

    /// A named checkpoint for time-travel debugging
    Checkpoint { label: String },

    /// A human review gate opened
    ReviewRequested {
        step: StepKey,
        reviewers: Vec<String>,
        scope: String,
        deadline: Option<DateTime<Utc>>,
    },

    /// A reviewer responded
    ReviewResponded {
        step: StepKey,
        approved: bool,
        payload: serde_json::Value,
    },

    /// Cancellation was requested; observed at the next suspension point
    CancelRequested { reason: String },

    /// The instance reached a terminal status
    Terminal {
        status: InstanceStatus,
        output: Option<serde_json::Value>,
        failure: Option<StepFailure>,
    },
}

impl LogEntryKind {
    /// Stable name, used as the discriminator column in SQL stores and as
    /// the replay filter vocabulary
    pub fn name(&self) -> &'static str {
        match self {
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::Retry { .. } => "retry",
            Self::SleepStarted { .. } => "sleep_started",
            Self::SleepFired { .. } => "sleep_fired",
            Self::EventAwaited { .. } => "event_awaited",
            Self::EventArrived { .. } => "event_arrived",
            Self::StateTransition { .. } => "state_transition",
            Self::ErrorRaised { .. } => "error_raised",
            Self::Checkpoint { .. } => "checkpoint",
            Self::ReviewRequested { .. } => "review_requested",
            Self::ReviewResponded { .. } => "review_responded",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::Terminal { .. } => "terminal",
        }
    }

    /// Whether this entry closes the instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    /// Entries that represent forward progress; none of these may appear
    /// after a `Terminal` entry
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::StepStarted { .. }
                | Self::StateTransition { .. }
                | Self::EventAwaited { .. }
                | Self::SleepStarted { .. }
        )
    }

    /// The step this entry concerns, if any
    pub fn step(&self) -> Option<&StepKey> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. }
            | Self::Retry { step, .. }
            | Self::ReviewRequested { step, .. }
            | Self::ReviewResponded { step, .. } => Some(step),
            _ => None,
        }
    }
}
