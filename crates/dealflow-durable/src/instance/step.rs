//! Step records: the memoization cache of the step runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepFailure;

/// Identity of a step occurrence within an instance
///
/// The ordinal packs the state-visit sequence into its high 32 bits and
/// the per-name occurrence within that visit into the low 32, so a state
/// entered twice never replays records from its first visit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub name: String,
    pub ordinal: u64,
}

impl StepKey {
    pub fn new(name: impl Into<String>, ordinal: u64) -> Self {
        Self {
            name: name.into(),
            ordinal,
        }
    }

    /// Compose the visit-scoped ordinal
    pub fn compose(name: impl Into<String>, visit: u32, seq: u32) -> Self {
        Self::new(name, ((visit as u64) << 32) | seq as u64)
    }

    /// The state-visit this occurrence belongs to
    pub fn visit(&self) -> u32 {
        (self.ordinal >> 32) as u32
    }

    /// The occurrence sequence within the visit
    pub fn seq(&self) -> u32 {
        (self.ordinal & 0xFFFF_FFFF) as u32
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}.{}", self.name, self.visit(), self.seq())
    }
}

/// The durable result of a step occurrence
///
/// Once `output` or `error` is set the record is settled: later attempts
/// of the same key return the stored result without re-running the body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub instance_id: Uuid,
    pub key: StepKey,

    /// SHA-256 of the canonical input, for input-drift diagnostics
    pub input_fingerprint: Option<String>,

    pub output: Option<serde_json::Value>,
    pub error: Option<StepFailure>,

    /// Attempts made so far (1-based after the first invocation)
    pub attempts: u32,

    /// Panics observed; beyond the configured budget the record is
    /// quarantined as `Permanent`
    pub panics: u32,

    /// A retry backoff timer is pending; do not re-run until it fires
    pub retry_pending: bool,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Fresh unsettled record
    pub fn open(instance_id: Uuid, key: StepKey, at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            key,
            input_fingerprint: None,
            output: None,
            error: None,
            attempts: 0,
            panics: 0,
            retry_pending: false,
            started_at: at,
            ended_at: None,
        }
    }

    /// Whether a result (success or terminal failure) has been recorded
    pub fn is_settled(&self) -> bool {
        self.output.is_some() || self.error.is_some()
    }

    /// Settle with a success value
    pub fn settle_ok(&mut self, output: serde_json::Value, at: DateTime<Utc>) {
        self.output = Some(output);
        self.error = None;
        self.retry_pending = false;
        self.ended_at = Some(at);
    }

    /// Settle with a terminal failure
    pub fn settle_err(&mut self, failure: StepFailure, at: DateTime<Utc>) {
        self.error = Some(failure);
        self.retry_pending = false;
        self.ended_at = Some(at);
    }
}
