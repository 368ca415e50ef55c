//! Failure values surfaced by the step runtime
//!
//! A [`StepFailure`] is a plain serializable value rather than a
//! `std::error::Error` chain because it is persisted into step records and
//! log entries and must round-trip through the store unchanged.

use serde::{Deserialize, Serialize};

/// Classification of a failure, drives retry and propagation behaviour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable by policy
    Transient,

    /// Fails the step immediately, never retried
    Permanent,

    /// A deadline elapsed before the awaited event or approval arrived
    Timeout,

    /// Cancellation was requested and observed at a suspension point
    Cancelled,

    /// Input violated an invariant
    Validation,

    /// A state guard rejected the instance
    Guard,

    /// The retry budget for a step is gone
    StepExhausted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Validation => "validation",
            Self::Guard => "guard",
            Self::StepExhausted => "step_exhausted",
        };
        write!(f, "{name}")
    }
}

/// A failure raised by a step body, a guard, or the runtime itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    /// Failure classification
    pub kind: ErrorKind,

    /// Human-readable message
    pub message: String,

    /// Additional structured detail for debugging
    pub details: Option<serde_json::Value>,
}

impl StepFailure {
    /// Create a failure of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Create a retryable failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Create a non-retryable failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Create a deadline failure
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Create a cancellation failure
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Create an input-validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a guard-violation failure
    pub fn guard(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Guard, message)
    }

    /// Create a retry-budget-exhausted failure wrapping the last error
    pub fn exhausted(step: impl std::fmt::Display, last: &StepFailure) -> Self {
        Self {
            kind: ErrorKind::StepExhausted,
            message: format!("retry budget exhausted for step {step}: {}", last.message),
            details: Some(serde_json::json!({
                "last_error_kind": last.kind,
                "last_error": last.message,
            })),
        }
    }

    /// Attach structured detail
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this failure terminates an instance when uncaught
    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StepFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        assert_eq!(StepFailure::transient("x").kind, ErrorKind::Transient);
        assert_eq!(StepFailure::permanent("x").kind, ErrorKind::Permanent);
        assert_eq!(StepFailure::timeout("x").kind, ErrorKind::Timeout);
        assert_eq!(StepFailure::guard("x").kind, ErrorKind::Guard);
    }

    #[test]
    fn exhausted_wraps_last_error() {
        let last = StepFailure::transient("connection reset");
        let wrapped = StepFailure::exhausted("publish_media#0", &last);

        assert_eq!(wrapped.kind, ErrorKind::StepExhausted);
        assert!(wrapped.message.contains("publish_media#0"));
        assert!(wrapped.message.contains("connection reset"));
    }

    #[test]
    fn serialization_round_trip() {
        let failure = StepFailure::validation("amount must be positive")
            .with_details(serde_json::json!({"amount": -5}));

        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"kind\":\"validation\""));

        let parsed: StepFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(failure, parsed);
    }
}
