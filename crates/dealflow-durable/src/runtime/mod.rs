//! Durable step runtime
//!
//! Handlers re-enter from the top on every resume; everything they did
//! before the last suspension short-circuits from memoized step records.
//! Suspension propagates as an [`Interrupt`] through `?`, so a handler
//! reads as straight-line async code.

mod context;
mod retry;

pub use context::{ApprovalOutcome, ParallelBranch, StepContext, StepOptions};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, StepFailure};
use crate::instance::StepKey;

/// Why an instance parked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuspendReason {
    /// A durable sleep timer is pending
    Sleep { step: StepKey },

    /// A retry backoff timer is pending
    Retry { step: StepKey },

    /// Waiting for an external event
    Wait { wait_id: Uuid, event: String },

    /// At least one parallel branch has not settled
    ParallelPending { step: StepKey },
}

/// Non-local exit from a handler
///
/// `Suspended` is not an error: it parks the instance until a timer fires
/// or an event arrives. `Faulted` carries a failure that the handler may
/// catch (e.g. a timeout driving an expiry transition) or let propagate
/// to fail the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    Suspended(SuspendReason),
    Faulted(StepFailure),
}

impl Interrupt {
    /// The failure, when faulted
    pub fn failure(&self) -> Option<&StepFailure> {
        match self {
            Self::Faulted(failure) => Some(failure),
            Self::Suspended(_) => None,
        }
    }

    /// Faulted with a deadline failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Faulted(f) if f.kind == ErrorKind::Timeout)
    }

    /// Faulted with a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Faulted(f) if f.kind == ErrorKind::Cancelled)
    }
}

impl From<StepFailure> for Interrupt {
    fn from(failure: StepFailure) -> Self {
        Self::Faulted(failure)
    }
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suspended(reason) => write!(f, "suspended: {reason:?}"),
            Self::Faulted(failure) => write!(f, "faulted: {failure}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_detection() {
        let interrupt = Interrupt::Faulted(StepFailure::timeout("deadline elapsed"));
        assert!(interrupt.is_timeout());
        assert!(!interrupt.is_cancelled());

        let suspended = Interrupt::Suspended(SuspendReason::Sleep {
            step: StepKey::compose("sleep:cooldown", 0, 0),
        });
        assert!(!suspended.is_timeout());
        assert!(suspended.failure().is_none());
    }

    #[test]
    fn from_failure_faults() {
        let interrupt: Interrupt = StepFailure::guard("amount below threshold").into();
        assert_eq!(interrupt.failure().unwrap().kind, ErrorKind::Guard);
    }
}
