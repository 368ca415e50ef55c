//! External collaborators the workflows orchestrate
//!
//! Side-effecting services live behind these traits so step bodies stay
//! replay-deterministic: whatever a collaborator returns is frozen into
//! the step record and never re-fetched. Every call takes the step's
//! idempotency key; real implementations must use it to make
//! at-least-once step execution at-most-once on the outside.
//!
//! The `Simulated*` implementations are deterministic, failure-injectable
//! stand-ins used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use dealflow_durable::StepFailure;

/// Sends notifications to deal parties
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        idempotency_key: &str,
        recipient: &str,
        subject: &str,
        body: Value,
    ) -> Result<Value, StepFailure>;
}

/// Drives the media pipeline (transcoders, CDN, analytics wiring)
///
/// The engine orchestrates these operations; it never touches media
/// bytes itself.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn perform(
        &self,
        idempotency_key: &str,
        operation: &str,
        input: Value,
    ) -> Result<Value, StepFailure>;
}

/// Runs model-backed analysis dimensions
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyse(
        &self,
        idempotency_key: &str,
        dimension: &str,
        input: Value,
    ) -> Result<Value, StepFailure>;
}

/// Bundle handed to every definition constructor
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub media: Arc<dyn MediaProcessor>,
    pub analyst: Arc<dyn AnalysisProvider>,
}

impl Collaborators {
    /// Deterministic in-process collaborators for tests and demos
    pub fn simulated() -> Self {
        Self {
            notifier: Arc::new(SimulatedNotifier::new()),
            media: Arc::new(SimulatedMediaProcessor::new()),
            analyst: Arc::new(SimulatedAnalysisProvider::new()),
        }
    }
}

/// Records every notification instead of sending it
pub struct SimulatedNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl SimulatedNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// (recipient, subject) pairs in send order
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

impl Default for SimulatedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for SimulatedNotifier {
    async fn notify(
        &self,
        idempotency_key: &str,
        recipient: &str,
        subject: &str,
        _body: Value,
    ) -> Result<Value, StepFailure> {
        self.sent
            .lock()
            .push((recipient.to_string(), subject.to_string()));
        Ok(json!({
            "delivered": true,
            "idempotency_key": idempotency_key,
        }))
    }
}

/// Deterministic media pipeline with injectable failures
pub struct SimulatedMediaProcessor {
    /// operation -> remaining failures before it starts succeeding
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
}

impl SimulatedMediaProcessor {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make `operation` fail transiently `times` times before succeeding
    pub fn fail_times(&self, operation: &str, times: u32) {
        self.failures.lock().insert(operation.to_string(), times);
    }

    /// Operations attempted, in order (including failed attempts)
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Default for SimulatedMediaProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProcessor for SimulatedMediaProcessor {
    async fn perform(
        &self,
        idempotency_key: &str,
        operation: &str,
        input: Value,
    ) -> Result<Value, StepFailure> {
        self.calls.lock().push(operation.to_string());

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(operation) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StepFailure::transient(format!(
                        "{operation} unavailable, try again"
                    )));
                }
            }
        }

        Ok(json!({
            "operation": operation,
            "ok": true,
            "idempotency_key": idempotency_key,
            "input": input,
        }))
    }
}

/// Returns a stable pseudo-score per analysis dimension
pub struct SimulatedAnalysisProvider {
    calls: Mutex<Vec<String>>,
}

impl SimulatedAnalysisProvider {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Dimensions analysed, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// How often one dimension was analysed
    pub fn count_for(&self, dimension: &str) -> usize {
        self.calls.lock().iter().filter(|d| *d == dimension).count()
    }
}

impl Default for SimulatedAnalysisProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisProvider for SimulatedAnalysisProvider {
    async fn analyse(
        &self,
        _idempotency_key: &str,
        dimension: &str,
        _input: Value,
    ) -> Result<Value, StepFailure> {
        self.calls.lock().push(dimension.to_string());

        // Stable per-dimension score so replays and asserts are exact
        let score = dimension
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
            % 100;
        Ok(json!({
            "dimension": dimension,
            "score": score,
            "confidence": 0.8,
        }))
    }
}
