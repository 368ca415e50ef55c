//! Step execution context
//!
//! Handed to every state ingress handler (and compensation handler). All
//! suspension points live here: `run_step`, `sleep`, `wait_for_event`,
//! `wait_for_approval`, `parallel` and `checkpoint`. Each one is backed by
//! a step record, which is what makes re-entry from the top of the handler
//! cheap and deterministic.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Interrupt, RetryPolicy, SuspendReason};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::StepFailure;
use crate::instance::{
    ApprovalRequest, InstanceRecord, LogEntryKind, PendingTimer, PendingWait, ResourceUsage,
    StepKey, StepRecord, TimerPurpose,
};
use crate::persistence::{InstanceStore, StoreError};

/// Per-step execution options
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Retry policy override; the definition default applies when unset
    pub retry: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn with_retry(policy: RetryPolicy) -> Self {
        Self {
            retry: Some(policy),
        }
    }
}

/// Result of a human review gate
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub reviewer: Option<String>,
    pub comment: Option<String>,
    pub payload: serde_json::Value,
}

impl ApprovalOutcome {
    /// Parse a review-response payload
    ///
    /// Accepts `{"approved": bool}` or `{"decision": "approve"|"reject"}`.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, StepFailure> {
        let approved = match payload.get("approved").and_then(|v| v.as_bool()) {
            Some(approved) => approved,
            None => match payload.get("decision").and_then(|v| v.as_str()) {
                Some("approve") | Some("approved") => true,
                Some("reject") | Some("rejected") => false,
                _ => {
                    return Err(StepFailure::validation(
                        "review response carries neither `approved` nor `decision`",
                    ))
                }
            },
        };

        Ok(Self {
            approved,
            reviewer: payload
                .get("reviewer")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            comment: payload
                .get("comment")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            payload: payload.clone(),
        })
    }
}

/// One branch of a `parallel` group
pub struct ParallelBranch {
    label: String,
    run: Box<dyn FnOnce(StepContext) -> BoxFuture<'static, Result<serde_json::Value, Interrupt>> + Send>,
}

impl ParallelBranch {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(StepContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, Interrupt>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(move |ctx| f(ctx).boxed()),
        }
    }
}

/// Execution context for a single resume of a single instance
///
/// Cheap to clone internally for parallel branches; each branch gets its
/// own step-name namespace and occurrence counters while sharing the
/// resume-wide resource counters.
pub struct StepContext {
    instance_id: Uuid,
    record: InstanceRecord,
    input: Arc<serde_json::Value>,
    visit: u32,
    prefix: String,
    /// Cancellation is not observed inside compensation handlers
    cancellable: bool,
    counters: Mutex<HashMap<String, u32>>,
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    default_retry: RetryPolicy,
    usage: Arc<Mutex<ResourceUsage>>,
}

impl StepContext {
    pub(crate) fn new(
        record: InstanceRecord,
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
        default_retry: RetryPolicy,
        cancellable: bool,
        prefix: String,
    ) -> Self {
        Self {
            instance_id: record.id,
            input: Arc::new(record.input.clone()),
            visit: record.visit,
            record,
            prefix,
            cancellable,
            counters: Mutex::new(HashMap::new()),
            store,
            clock,
            config,
            default_retry,
            usage: Arc::new(Mutex::new(ResourceUsage::default())),
        }
    }

    /// The instance this context executes
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Immutable instance input
    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Current state name
    pub fn state(&self) -> &str {
        &self.record.state
    }

    /// Count an externally visible side effect for the resource monitor
    pub fn record_external_call(&self) {
        self.usage.lock().external_calls += 1;
    }

    /// Deterministic idempotency key for the current step occurrence
    ///
    /// Side-effecting collaborators should pass this through so that
    /// at-least-once execution is observationally at-most-once outside.
    pub fn idempotency_key(&self, step: &StepKey) -> String {
        format!("{}/{}", self.instance_id, step)
    }

    /// Drain the accumulated resource counters
    pub(crate) fn take_usage(&self) -> ResourceUsage {
        std::mem::take(&mut *self.usage.lock())
    }

    /// Handle onto the shared counters, usable after the context has been
    /// moved into a handler
    pub(crate) fn usage_handle(&self) -> Arc<Mutex<ResourceUsage>> {
        self.usage.clone()
    }

    // =========================================================================
    // Suspension points
    // =========================================================================

    /// Execute a memoized step
    ///
    /// The body runs at most once per attempt; a settled record
    /// short-circuits without re-invoking it. Transient failures retry
    /// under the definition's default policy.
    pub async fn run_step<F, Fut>(
        &self,
        name: &str,
        input: serde_json::Value,
        body: F,
    ) -> Result<serde_json::Value, Interrupt>
    where
        F: FnOnce(serde_json::Value) -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, StepFailure>> + Send,
    {
        self.run_step_opts(name, input, StepOptions::default(), body)
            .await
    }

    /// Execute a memoized step with an explicit retry policy
    pub async fn run_step_opts<F, Fut>(
        &self,
        name: &str,
        input: serde_json::Value,
        options: StepOptions,
        body: F,
    ) -> Result<serde_json::Value, Interrupt>
    where
        F: FnOnce(serde_json::Value) -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, StepFailure>> + Send,
    {
        let key = self.step_key(name);
        self.check_cancelled().await?;

        let policy = options.retry.unwrap_or_else(|| self.default_retry.clone());
        let now = self.clock.now();

        let mut record = match self.get_step(&key).await? {
            Some(existing) => {
                if let Some(output) = &existing.output {
                    return Ok(output.clone());
                }
                if let Some(error) = &existing.error {
                    return Err(Interrupt::Faulted(error.clone()));
                }
                if existing.retry_pending {
                    // A forked or repaired instance may lack the backoff
                    // timer backing this gate; re-arm it so the retry
                    // eventually fires
                    self.ensure_retry_timer(&key, &policy, existing.attempts)
                        .await?;
                    return Err(Interrupt::Suspended(SuspendReason::Retry { step: key }));
                }
                existing
            }
            None => {
                let mut fresh = StepRecord::open(self.instance_id, key.clone(), now);
                fresh.input_fingerprint = Some(fingerprint(&input));
                fresh
            }
        };

        record.attempts += 1;
        let attempt = record.attempts;
        self.put_step(&record).await?;
        self.append(vec![LogEntryKind::StepStarted {
            step: key.clone(),
            attempt,
        }])
        .await?;

        debug!(instance_id = %self.instance_id, step = %key, attempt, "running step body");
        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(body(input)).catch_unwind().await;
        self.usage.lock().busy_ms += started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                record.settle_ok(value.clone(), self.clock.now());
                self.put_step(&record).await?;
                self.append(vec![LogEntryKind::StepCompleted {
                    step: key,
                    result: value.clone(),
                }])
                .await?;
                self.usage.lock().steps_executed += 1;
                Ok(value)
            }
            Ok(Err(failure)) => self.settle_failed_attempt(record, failure, &policy).await,
            Err(panic) => {
                record.panics += 1;
                let message = panic_message(panic);
                warn!(
                    instance_id = %self.instance_id,
                    step = %record.key,
                    panics = record.panics,
                    "step body panicked: {message}"
                );

                if record.panics > self.config.max_panics {
                    // Quarantine: prevents infinite restarts on replay
                    let failure = StepFailure::permanent(format!(
                        "step quarantined after {} panics: {message}",
                        record.panics
                    ));
                    record.settle_err(failure.clone(), self.clock.now());
                    self.put_step(&record).await?;
                    self.append(vec![LogEntryKind::StepFailed {
                        step: record.key.clone(),
                        failure: failure.clone(),
                    }])
                    .await?;
                    Err(Interrupt::Faulted(failure))
                } else {
                    let failure = StepFailure::transient(format!("step body panicked: {message}"));
                    self.settle_failed_attempt(record, failure, &policy).await
                }
            }
        }
    }

    /// Durable sleep; resumes after `duration` has elapsed on the wall clock
    pub async fn sleep(&self, purpose: &str, duration: Duration) -> Result<(), Interrupt> {
        let key = self.step_key(&format!("sleep:{purpose}"));
        self.check_cancelled().await?;

        if let Some(existing) = self.get_step(&key).await? {
            if existing.output.is_some() {
                return Ok(());
            }
            if let Some(error) = existing.error {
                return Err(Interrupt::Faulted(error));
            }
            // Unsettled: a fork does not inherit pending timer rows, so
            // re-arm the timer when it is missing
            let armed = self
                .store
                .list_timers(self.instance_id)
                .await
                .map_err(store_fault)?
                .iter()
                .any(|t| matches!(&t.purpose, TimerPurpose::Sleep { step } if step == &key));
            if !armed {
                let timer = PendingTimer {
                    id: Uuid::now_v7(),
                    instance_id: self.instance_id,
                    fire_at: self.clock.now() + to_delta(duration),
                    purpose: TimerPurpose::Sleep { step: key.clone() },
                };
                self.store.put_timer(&timer).await.map_err(store_fault)?;
            }
            return Err(Interrupt::Suspended(SuspendReason::Sleep { step: key }));
        }

        let now = self.clock.now();
        let timer = PendingTimer {
            id: Uuid::now_v7(),
            instance_id: self.instance_id,
            fire_at: now + to_delta(duration),
            purpose: TimerPurpose::Sleep { step: key.clone() },
        };

        let mut record = StepRecord::open(self.instance_id, key.clone(), now);
        record.attempts = 1;
        self.put_step(&record).await?;
        self.store
            .put_timer(&timer)
            .await
            .map_err(store_fault)?;
        self.append(vec![LogEntryKind::SleepStarted {
            timer_id: timer.id,
            duration_ms: duration.as_millis() as u64,
            purpose: purpose.to_string(),
        }])
        .await?;

        Err(Interrupt::Suspended(SuspendReason::Sleep { step: key }))
    }

    /// Wait for a named external event
    ///
    /// The payload is frozen into the step record on arrival and never
    /// re-read from the outside world. A `deadline` resumes the wait with
    /// a timeout failure, which the handler may catch.
    pub async fn wait_for_event(
        &self,
        event: &str,
        correlation_key: Option<String>,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value, Interrupt> {
        self.wait_internal(event, correlation_key, deadline, None)
            .await
    }

    /// Wait for a human review response
    ///
    /// A specialisation of `wait_for_event` that records the review gate
    /// in the log and parses the response payload.
    pub async fn wait_for_approval(
        &self,
        event: &str,
        scope: &str,
        reviewers: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ApprovalOutcome, Interrupt> {
        let approval = ApprovalRequest {
            reviewers,
            scope: scope.to_string(),
        };
        let payload = self
            .wait_internal(event, None, timeout, Some(approval))
            .await?;
        ApprovalOutcome::from_payload(&payload).map_err(Interrupt::Faulted)
    }

    /// Wait for the first of several events
    ///
    /// Registers a wait per event name; the first arrival wins and the
    /// losing waits are withdrawn so they cannot swallow later events.
    /// Returns the winning event name and its payload. A deadline applies
    /// to the whole select and resumes it with a timeout failure.
    pub async fn wait_for_any(
        &self,
        events: &[&str],
        deadline: Option<Duration>,
    ) -> Result<(String, serde_json::Value), Interrupt> {
        let keys: Vec<(String, StepKey)> = events
            .iter()
            .map(|event| {
                (
                    (*event).to_string(),
                    self.step_key(&format!("wait:{event}")),
                )
            })
            .collect();
        self.check_cancelled().await?;

        let mut records = Vec::with_capacity(keys.len());
        for (_, key) in &keys {
            records.push(self.get_step(key).await?);
        }

        // A settled arrival wins over everything else
        if let Some(winner) = records
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.output.is_some()))
        {
            self.withdraw_losing_waits(&keys, winner).await?;
            let payload = records[winner]
                .as_ref()
                .and_then(|r| r.output.clone())
                .unwrap_or(serde_json::Value::Null);
            return Ok((keys[winner].0.clone(), payload));
        }

        // A recorded failure (deadline, injected timeout) resumes the
        // select; withdrawn-loser markers are not failures of the select
        if let Some(failed) = records.iter().position(|r| {
            r.as_ref().is_some_and(|r| {
                r.error
                    .as_ref()
                    .is_some_and(|e| e.kind != crate::ErrorKind::Cancelled)
            })
        }) {
            self.withdraw_losing_waits(&keys, failed).await?;
            let failure = records[failed]
                .as_ref()
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| StepFailure::timeout("wait failed"));
            return Err(Interrupt::Faulted(failure));
        }

        let now = self.clock.now();

        // Late-subscriber path: one of the events may already be queued
        for (i, (event, key)) in keys.iter().enumerate() {
            if records[i].is_some() {
                continue;
            }
            self.usage.lock().store_reads += 1;
            if let Some(queued) = self
                .store
                .dequeue_event(event, None, now)
                .await
                .map_err(store_fault)?
            {
                let mut record = StepRecord::open(self.instance_id, key.clone(), now);
                record.attempts = 1;
                record.settle_ok(queued.payload.clone(), now);
                self.put_step(&record).await?;
                self.append(vec![LogEntryKind::EventArrived {
                    wait_id: queued.id,
                    event: event.clone(),
                    correlation_key: None,
                    payload: queued.payload.clone(),
                }])
                .await?;
                self.usage.lock().events_consumed += 1;
                self.withdraw_losing_waits(&keys, i).await?;
                return Ok((event.clone(), queued.payload));
            }
        }

        // Register whatever is not registered yet and park
        let mut entries = Vec::new();
        let registered = self
            .store
            .list_waits(self.instance_id)
            .await
            .map_err(store_fault)?;
        for (i, (event, key)) in keys.iter().enumerate() {
            if records[i].is_none() {
                let mut record = StepRecord::open(self.instance_id, key.clone(), now);
                record.attempts = 1;
                self.put_step(&record).await?;
            }
            if !registered.iter().any(|w| &w.step == key) {
                let (wait_id, deadline_at) = self
                    .register_wait(key, event, None, deadline, None)
                    .await?;
                if records[i].is_none() {
                    entries.push(LogEntryKind::EventAwaited {
                        wait_id,
                        event: event.clone(),
                        correlation_key: None,
                        deadline: deadline_at,
                    });
                }
            }
        }
        if !entries.is_empty() {
            self.append(entries).await?;
        }

        Err(Interrupt::Suspended(SuspendReason::Wait {
            wait_id: Uuid::nil(),
            event: events.join("|"),
        }))
    }

    /// Withdraw every wait of the select except the winner's
    async fn withdraw_losing_waits(
        &self,
        keys: &[(String, StepKey)],
        winner: usize,
    ) -> Result<(), Interrupt> {
        let waits = self
            .store
            .list_waits(self.instance_id)
            .await
            .map_err(store_fault)?;
        let timers = self
            .store
            .list_timers(self.instance_id)
            .await
            .map_err(store_fault)?;

        for (i, (_, key)) in keys.iter().enumerate() {
            if i == winner {
                continue;
            }
            let Some(wait) = waits.iter().find(|w| &w.step == key) else {
                continue;
            };
            self.store
                .complete_wait(
                    wait.id,
                    &crate::persistence::WaitOutcome::Failed(StepFailure::cancelled(
                        "superseded by a sibling event",
                    )),
                    self.clock.now(),
                )
                .await
                .map_err(store_fault)?;
            for timer in &timers {
                if matches!(&timer.purpose, TimerPurpose::WaitDeadline { wait_id } if *wait_id == wait.id)
                {
                    self.store
                        .remove_timer(timer.id)
                        .await
                        .map_err(store_fault)?;
                }
            }
        }
        Ok(())
    }

    /// Run branches concurrently within this instance's worker slot
    ///
    /// The fan-in is itself a single memoized step whose output is the
    /// array of branch results in declaration order. Branch sub-steps are
    /// memoized individually, so partial progress survives suspension.
    pub async fn parallel(
        &self,
        name: &str,
        branches: Vec<ParallelBranch>,
    ) -> Result<Vec<serde_json::Value>, Interrupt> {
        let key = self.step_key(&format!("parallel:{name}"));
        self.check_cancelled().await?;

        if let Some(existing) = self.get_step(&key).await? {
            if let Some(output) = existing.output {
                return Ok(as_array(output));
            }
            if let Some(error) = existing.error {
                return Err(Interrupt::Faulted(error));
            }
        } else {
            let mut record = StepRecord::open(self.instance_id, key.clone(), self.clock.now());
            record.attempts = 1;
            self.put_step(&record).await?;
            self.append(vec![LogEntryKind::StepStarted {
                step: key.clone(),
                attempt: 1,
            }])
            .await?;
        }

        let futures: Vec<_> = branches
            .into_iter()
            .map(|branch| {
                let ctx = self.branch(&format!("{name}/{}", branch.label));
                (branch.run)(ctx)
            })
            .collect();
        let results = join_all(futures).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut pending = false;
        let mut faulted: Option<StepFailure> = None;
        for result in results {
            match result {
                Ok(value) => outputs.push(value),
                Err(Interrupt::Suspended(_)) => pending = true,
                Err(Interrupt::Faulted(failure)) => {
                    faulted.get_or_insert(failure);
                }
            }
        }

        if let Some(failure) = faulted {
            let mut record = self
                .get_step(&key)
                .await?
                .unwrap_or_else(|| StepRecord::open(self.instance_id, key.clone(), self.clock.now()));
            record.settle_err(failure.clone(), self.clock.now());
            self.put_step(&record).await?;
            self.append(vec![LogEntryKind::StepFailed {
                step: key,
                failure: failure.clone(),
            }])
            .await?;
            return Err(Interrupt::Faulted(failure));
        }

        if pending {
            return Err(Interrupt::Suspended(SuspendReason::ParallelPending {
                step: key,
            }));
        }

        let mut record = self
            .get_step(&key)
            .await?
            .unwrap_or_else(|| StepRecord::open(self.instance_id, key.clone(), self.clock.now()));
        record.settle_ok(serde_json::Value::Array(outputs.clone()), self.clock.now());
        self.put_step(&record).await?;
        self.append(vec![LogEntryKind::StepCompleted {
            step: key,
            result: serde_json::Value::Array(outputs.clone()),
        }])
        .await?;
        self.usage.lock().steps_executed += 1;

        Ok(outputs)
    }

    /// Record a named checkpoint (idempotent per label occurrence)
    pub async fn checkpoint(&self, label: &str) -> Result<(), Interrupt> {
        let key = self.step_key(&format!("checkpoint:{label}"));
        if self.get_step(&key).await?.is_some() {
            return Ok(());
        }

        let now = self.clock.now();
        let mut record = StepRecord::open(self.instance_id, key, now);
        record.attempts = 1;
        record.settle_ok(serde_json::Value::Null, now);
        self.put_step(&record).await?;
        self.append(vec![LogEntryKind::Checkpoint {
            label: label.to_string(),
        }])
        .await?;
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Derived context for a parallel branch: fresh counters, namespaced
    /// step names, shared usage
    fn branch(&self, label: &str) -> StepContext {
        StepContext {
            instance_id: self.instance_id,
            record: self.record.clone(),
            input: self.input.clone(),
            visit: self.visit,
            prefix: format!("{}{label}/", self.prefix),
            cancellable: self.cancellable,
            counters: Mutex::new(HashMap::new()),
            store: self.store.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            default_retry: self.default_retry.clone(),
            usage: self.usage.clone(),
        }
    }

    /// Assign the visit-scoped key for the next occurrence of `name`
    ///
    /// Occurrence counters are per-context, so the assignment depends only
    /// on the handler's own call order, never on scheduling.
    fn step_key(&self, name: &str) -> StepKey {
        let full = format!("{}{name}", self.prefix);
        let mut counters = self.counters.lock();
        let seq = counters.entry(full.clone()).or_insert(0);
        let key = StepKey::compose(full, self.visit, *seq);
        *seq += 1;
        key
    }

    async fn check_cancelled(&self) -> Result<(), Interrupt> {
        if !self.cancellable {
            return Ok(());
        }
        let record = self.get_instance().await?;
        if let Some(reason) = record.cancel_requested {
            return Err(Interrupt::Faulted(StepFailure::cancelled(reason)));
        }
        Ok(())
    }

    async fn wait_internal(
        &self,
        event: &str,
        correlation_key: Option<String>,
        deadline: Option<Duration>,
        approval: Option<ApprovalRequest>,
    ) -> Result<serde_json::Value, Interrupt> {
        let key = self.step_key(&format!("wait:{event}"));
        self.check_cancelled().await?;

        if let Some(existing) = self.get_step(&key).await? {
            if let Some(payload) = existing.output {
                return Ok(payload);
            }
            if let Some(error) = existing.error {
                return Err(Interrupt::Faulted(error));
            }
            // Unsettled: a fork does not inherit pending wait rows, so
            // re-register the wait (with a fresh deadline) when missing
            let registered = self
                .store
                .list_waits(self.instance_id)
                .await
                .map_err(store_fault)?
                .into_iter()
                .find(|w| w.step == key);
            let wait_id = match registered {
                Some(wait) => wait.id,
                None => {
                    self.register_wait(&key, event, correlation_key, deadline, approval)
                        .await?
                        .0
                }
            };
            return Err(Interrupt::Suspended(SuspendReason::Wait {
                wait_id,
                event: event.to_string(),
            }));
        }

        let now = self.clock.now();

        // Late-subscriber path: the event may have been published before
        // this wait was registered
        self.usage.lock().store_reads += 1;
        if let Some(queued) = self
            .store
            .dequeue_event(event, correlation_key.as_deref(), now)
            .await
            .map_err(store_fault)?
        {
            let mut record = StepRecord::open(self.instance_id, key.clone(), now);
            record.attempts = 1;
            record.settle_ok(queued.payload.clone(), now);
            self.put_step(&record).await?;

            let mut entries = vec![LogEntryKind::EventArrived {
                wait_id: queued.id,
                event: event.to_string(),
                correlation_key: correlation_key.clone(),
                payload: queued.payload.clone(),
            }];
            if approval.is_some() {
                entries.push(LogEntryKind::ReviewResponded {
                    step: key,
                    approved: queued
                        .payload
                        .get("approved")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    payload: queued.payload.clone(),
                });
            }
            self.append(entries).await?;
            self.usage.lock().events_consumed += 1;
            return Ok(queued.payload);
        }

        let mut record = StepRecord::open(self.instance_id, key.clone(), now);
        record.attempts = 1;
        self.put_step(&record).await?;

        let (wait_id, deadline_at) = self
            .register_wait(&key, event, correlation_key.clone(), deadline, approval.clone())
            .await?;

        let mut entries = vec![LogEntryKind::EventAwaited {
            wait_id,
            event: event.to_string(),
            correlation_key,
            deadline: deadline_at,
        }];
        if let Some(request) = approval {
            entries.push(LogEntryKind::ReviewRequested {
                step: key,
                reviewers: request.reviewers,
                scope: request.scope,
                deadline: deadline_at,
            });
        }
        self.append(entries).await?;

        Err(Interrupt::Suspended(SuspendReason::Wait {
            wait_id,
            event: event.to_string(),
        }))
    }

    /// Re-arm the backoff timer gating a retry-pending record when the
    /// row is missing (forked instances do not inherit timers)
    async fn ensure_retry_timer(
        &self,
        key: &StepKey,
        policy: &RetryPolicy,
        attempts: u32,
    ) -> Result<(), Interrupt> {
        let armed = self
            .store
            .list_timers(self.instance_id)
            .await
            .map_err(store_fault)?
            .iter()
            .any(|t| matches!(&t.purpose, TimerPurpose::Retry { step } if step == key));
        if !armed {
            let timer = PendingTimer {
                id: Uuid::now_v7(),
                instance_id: self.instance_id,
                fire_at: self.clock.now() + to_delta(policy.backoff_for(attempts)),
                purpose: TimerPurpose::Retry { step: key.clone() },
            };
            self.store.put_timer(&timer).await.map_err(store_fault)?;
        }
        Ok(())
    }

    /// Create the pending-wait row and its deadline timer
    async fn register_wait(
        &self,
        key: &StepKey,
        event: &str,
        correlation_key: Option<String>,
        deadline: Option<Duration>,
        approval: Option<ApprovalRequest>,
    ) -> Result<(Uuid, Option<chrono::DateTime<chrono::Utc>>), Interrupt> {
        let now = self.clock.now();
        let wait_id = Uuid::now_v7();
        let deadline_at = deadline.map(|d| now + to_delta(d));

        let wait = PendingWait {
            id: wait_id,
            instance_id: self.instance_id,
            event_name: event.to_string(),
            correlation_key,
            deadline: deadline_at,
            step: key.clone(),
            approval,
            registered_at: now,
        };
        self.store.put_wait(&wait).await.map_err(store_fault)?;

        if let Some(at) = deadline_at {
            let timer = PendingTimer {
                id: Uuid::now_v7(),
                instance_id: self.instance_id,
                fire_at: at,
                purpose: TimerPurpose::WaitDeadline { wait_id },
            };
            self.store.put_timer(&timer).await.map_err(store_fault)?;
        }
        Ok((wait_id, deadline_at))
    }

    async fn settle_failed_attempt(
        &self,
        mut record: StepRecord,
        failure: StepFailure,
        policy: &RetryPolicy,
    ) -> Result<serde_json::Value, Interrupt> {
        let key = record.key.clone();

        if policy.retries(failure.kind) {
            if policy.has_attempts_remaining(record.attempts) {
                let backoff = policy.backoff_for(record.attempts);
                record.retry_pending = true;
                self.put_step(&record).await?;

                let timer = PendingTimer {
                    id: Uuid::now_v7(),
                    instance_id: self.instance_id,
                    fire_at: self.clock.now() + to_delta(backoff),
                    purpose: TimerPurpose::Retry { step: key.clone() },
                };
                self.store.put_timer(&timer).await.map_err(store_fault)?;
                self.append(vec![LogEntryKind::Retry {
                    step: key.clone(),
                    attempt: record.attempts,
                    backoff_ms: backoff.as_millis() as u64,
                }])
                .await?;
                self.usage.lock().retries += 1;

                debug!(
                    instance_id = %self.instance_id,
                    step = %key,
                    attempt = record.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "step failed, retry scheduled"
                );
                return Err(Interrupt::Suspended(SuspendReason::Retry { step: key }));
            }

            let exhausted = StepFailure::exhausted(&key, &failure);
            record.settle_err(exhausted.clone(), self.clock.now());
            self.put_step(&record).await?;
            self.append(vec![LogEntryKind::StepFailed {
                step: key,
                failure: exhausted.clone(),
            }])
            .await?;
            return Err(Interrupt::Faulted(exhausted));
        }

        record.settle_err(failure.clone(), self.clock.now());
        self.put_step(&record).await?;
        self.append(vec![LogEntryKind::StepFailed {
            step: key,
            failure: failure.clone(),
        }])
        .await?;
        Err(Interrupt::Faulted(failure))
    }

    async fn get_instance(&self) -> Result<InstanceRecord, Interrupt> {
        self.usage.lock().store_reads += 1;
        self.store
            .get_instance(self.instance_id)
            .await
            .map_err(store_fault)
    }

    async fn get_step(&self, key: &StepKey) -> Result<Option<StepRecord>, Interrupt> {
        self.usage.lock().store_reads += 1;
        self.store
            .get_step(self.instance_id, key)
            .await
            .map_err(store_fault)
    }

    async fn put_step(&self, record: &StepRecord) -> Result<(), Interrupt> {
        self.usage.lock().store_writes += 1;
        self.store.put_step(record).await.map_err(store_fault)
    }

    async fn append(&self, entries: Vec<LogEntryKind>) -> Result<(), Interrupt> {
        self.usage.lock().store_writes += 1;
        self.store
            .append(self.instance_id, self.clock.now(), entries, &self.record)
            .await
            .map(|_| ())
            .map_err(store_fault)
    }
}

fn store_fault(error: StoreError) -> Interrupt {
    Interrupt::Faulted(StepFailure::transient(format!("store error: {error}")))
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::MAX)
}

fn as_array(value: serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    }
}

fn fingerprint(input: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(input).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::instance::InstanceStatus;
    use crate::persistence::MemoryInstanceStore;
    use serde_json::json;

    async fn ctx_fixture() -> (Arc<MemoryInstanceStore>, Arc<MockClock>, StepContext) {
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = MockClock::from_system();
        let record = InstanceRecord::new(
            Uuid::now_v7(),
            "test_kind",
            "v1",
            "Start",
            json!({"amount": 100}),
            clock.now(),
        );
        store.create_instance(&record, None).await.unwrap();

        let ctx = StepContext::new(
            record,
            store.clone() as Arc<dyn InstanceStore>,
            clock.clone() as Arc<dyn Clock>,
            Arc::new(EngineConfig::default()),
            RetryPolicy::new(3).with_jitter(0.0),
            true,
            String::new(),
        );
        (store, clock, ctx)
    }

    #[tokio::test]
    async fn step_body_runs_once_and_memoizes() {
        let (_store, _clock, ctx) = ctx_fixture().await;

        let first = ctx
            .run_step("compute", json!({}), |_| async { Ok(json!({"n": 7})) })
            .await
            .unwrap();
        assert_eq!(first, json!({"n": 7}));
    }

    #[tokio::test]
    async fn second_context_short_circuits_without_invoking_body() {
        let (store, clock, ctx) = ctx_fixture().await;
        let record = store.get_instance(ctx.instance_id()).await.unwrap();

        ctx.run_step("compute", json!({}), |_| async { Ok(json!(1)) })
            .await
            .unwrap();

        // Fresh context, as after a crash and re-lease
        let replay = StepContext::new(
            record,
            store.clone() as Arc<dyn InstanceStore>,
            clock as Arc<dyn Clock>,
            Arc::new(EngineConfig::default()),
            RetryPolicy::new(3),
            true,
            String::new(),
        );
        let value = replay
            .run_step("compute", json!({}), |_| async {
                panic!("body must not re-run for a settled step")
            })
            .await
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let (store, _clock, ctx) = ctx_fixture().await;

        let result = ctx
            .run_step("flaky", json!({}), |_| async {
                Err(StepFailure::transient("upstream 503"))
            })
            .await;

        assert!(matches!(
            result,
            Err(Interrupt::Suspended(SuspendReason::Retry { .. }))
        ));
        assert_eq!(store.timer_count(), 1);

        let steps = store.list_steps(ctx.instance_id()).await.unwrap();
        assert!(steps[0].retry_pending);
        assert_eq!(steps[0].attempts, 1);
    }

    #[tokio::test]
    async fn permanent_failure_settles_immediately() {
        let (store, _clock, ctx) = ctx_fixture().await;

        let result = ctx
            .run_step("strict", json!({}), |_| async {
                Err(StepFailure::permanent("bad input"))
            })
            .await;

        assert!(matches!(result, Err(Interrupt::Faulted(f)) if f.kind == crate::ErrorKind::Permanent));
        // No retry timer for non-retryable failures
        assert_eq!(store.timer_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_budget_becomes_step_exhausted() {
        let (store, clock, ctx) = ctx_fixture().await;
        let record = store.get_instance(ctx.instance_id()).await.unwrap();
        let policy = RetryPolicy::new(2).with_jitter(0.0);

        // First attempt: schedules a retry
        let r = ctx
            .run_step_opts(
                "flaky",
                json!({}),
                StepOptions::with_retry(policy.clone()),
                |_| async { Err(StepFailure::transient("boom")) },
            )
            .await;
        assert!(matches!(r, Err(Interrupt::Suspended(_))));

        // Simulate the retry timer having fired
        let steps = store.list_steps(record.id).await.unwrap();
        let mut step = steps[0].clone();
        step.retry_pending = false;
        store.put_step(&step).await.unwrap();

        // Second attempt in a fresh context: budget gone
        let replay = StepContext::new(
            record,
            store.clone() as Arc<dyn InstanceStore>,
            clock as Arc<dyn Clock>,
            Arc::new(EngineConfig::default()),
            RetryPolicy::new(3),
            true,
            String::new(),
        );
        let r = replay
            .run_step_opts(
                "flaky",
                json!({}),
                StepOptions::with_retry(policy),
                |_| async { Err(StepFailure::transient("boom again")) },
            )
            .await;
        assert!(
            matches!(r, Err(Interrupt::Faulted(f)) if f.kind == crate::ErrorKind::StepExhausted)
        );
    }

    #[tokio::test]
    async fn wait_registers_and_suspends() {
        let (store, _clock, ctx) = ctx_fixture().await;

        let result = ctx
            .wait_for_event("qualify", None, Some(Duration::from_secs(3600)))
            .await;
        assert!(matches!(
            result,
            Err(Interrupt::Suspended(SuspendReason::Wait { .. }))
        ));

        assert_eq!(store.wait_count(), 1);
        // Deadline timer registered alongside the wait
        assert_eq!(store.timer_count(), 1);
    }

    #[tokio::test]
    async fn wait_consumes_pre_published_event() {
        let (store, clock, ctx) = ctx_fixture().await;

        let queued = crate::instance::QueuedEvent {
            id: Uuid::now_v7(),
            name: "qualify".into(),
            correlation_key: None,
            payload: json!({"qualified": true}),
            published_at: clock.now(),
            expires_at: clock.now() + TimeDelta::try_hours(1).unwrap(),
        };
        store.enqueue_event(&queued, 100).await.unwrap();

        let payload = ctx.wait_for_event("qualify", None, None).await.unwrap();
        assert_eq!(payload, json!({"qualified": true}));
        assert_eq!(store.wait_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_any_first_event_wins_and_losers_withdraw() {
        let (store, clock, ctx) = ctx_fixture().await;

        let result = ctx.wait_for_any(&["approve", "withdraw"], None).await;
        assert!(matches!(result, Err(Interrupt::Suspended(_))));
        assert_eq!(store.wait_count(), 2);

        let wait = store
            .find_wait("approve", None, None)
            .await
            .unwrap()
            .unwrap();
        store
            .complete_wait(
                wait.id,
                &crate::persistence::WaitOutcome::Delivered(json!({"ok": true})),
                clock.now(),
            )
            .await
            .unwrap();

        // Fresh context, as the dispatcher would build on resume
        let record = store.get_instance(ctx.instance_id()).await.unwrap();
        let replay = StepContext::new(
            record,
            store.clone() as Arc<dyn InstanceStore>,
            clock as Arc<dyn Clock>,
            Arc::new(EngineConfig::default()),
            RetryPolicy::new(3),
            true,
            String::new(),
        );
        let (event, payload) = replay
            .wait_for_any(&["approve", "withdraw"], None)
            .await
            .unwrap();

        assert_eq!(event, "approve");
        assert_eq!(payload, json!({"ok": true}));
        // The losing wait cannot swallow later events
        assert_eq!(store.wait_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_observed_at_step_boundary() {
        let (store, clock, ctx) = ctx_fixture().await;
        store
            .request_cancel(ctx.instance_id(), "user asked", clock.now())
            .await
            .unwrap();

        let result = ctx
            .run_step("anything", json!({}), |_| async { Ok(json!(null)) })
            .await;
        assert!(matches!(result, Err(ref i) if i.is_cancelled()));
    }

    #[tokio::test]
    async fn parallel_settles_as_single_step() {
        let (store, _clock, ctx) = ctx_fixture().await;

        let outputs = ctx
            .parallel(
                "analyses",
                vec![
                    ParallelBranch::new("left", |ctx: StepContext| async move {
                        ctx.run_step("work", json!({}), |_| async { Ok(json!("L")) })
                            .await
                    }),
                    ParallelBranch::new("right", |ctx: StepContext| async move {
                        ctx.run_step("work", json!({}), |_| async { Ok(json!("R")) })
                            .await
                    }),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outputs, vec![json!("L"), json!("R")]);

        let steps = store.list_steps(ctx.instance_id()).await.unwrap();
        let group = steps
            .iter()
            .find(|s| s.key.name == "parallel:analyses")
            .unwrap();
        assert_eq!(group.output, Some(json!(["L", "R"])));
        // Branch steps are namespaced and individually memoized
        assert!(steps.iter().any(|s| s.key.name == "analyses/left/work"));
        assert!(steps.iter().any(|s| s.key.name == "analyses/right/work"));
    }

    #[tokio::test]
    async fn parallel_with_suspended_branch_stays_pending() {
        let (store, _clock, ctx) = ctx_fixture().await;

        let result = ctx
            .parallel(
                "mixed",
                vec![
                    ParallelBranch::new("done", |ctx: StepContext| async move {
                        ctx.run_step("work", json!({}), |_| async { Ok(json!(1)) })
                            .await
                    }),
                    ParallelBranch::new("waiting", |ctx: StepContext| async move {
                        ctx.wait_for_event("external", None, None).await
                    }),
                ],
            )
            .await;

        assert!(matches!(
            result,
            Err(Interrupt::Suspended(SuspendReason::ParallelPending { .. }))
        ));
        // The finished branch's progress is durable
        let steps = store.list_steps(ctx.instance_id()).await.unwrap();
        let done = steps.iter().find(|s| s.key.name == "mixed/done/work").unwrap();
        assert_eq!(done.output, Some(json!(1)));
    }

    #[tokio::test]
    async fn repeated_step_names_get_distinct_ordinals() {
        let (store, _clock, ctx) = ctx_fixture().await;

        ctx.run_step("notify", json!({"n": 1}), |_| async { Ok(json!(1)) })
            .await
            .unwrap();
        ctx.run_step("notify", json!({"n": 2}), |_| async { Ok(json!(2)) })
            .await
            .unwrap();

        let steps = store.list_steps(ctx.instance_id()).await.unwrap();
        let ordinals: Vec<_> = steps
            .iter()
            .filter(|s| s.key.name == "notify")
            .map(|s| s.key.seq())
            .collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[tokio::test]
    async fn panic_quarantine_after_budget() {
        let (store, clock, ctx) = ctx_fixture().await;
        let mut config = EngineConfig::default();
        config.max_panics = 1;
        let config = Arc::new(config);
        let record = store.get_instance(ctx.instance_id()).await.unwrap();
        drop(ctx);

        let make_ctx = || {
            StepContext::new(
                record.clone(),
                store.clone() as Arc<dyn InstanceStore>,
                clock.clone() as Arc<dyn Clock>,
                config.clone(),
                RetryPolicy::new(10).with_jitter(0.0),
                true,
                String::new(),
            )
        };

        // First panic: tolerated, retry scheduled
        let r = make_ctx()
            .run_step("poison", json!({}), |_| async { panic!("kaboom") })
            .await;
        assert!(matches!(r, Err(Interrupt::Suspended(_))));

        // Clear the retry gate as the fired timer would
        let mut step = store.list_steps(record.id).await.unwrap()[0].clone();
        step.retry_pending = false;
        store.put_step(&step).await.unwrap();

        // Second panic: beyond budget, quarantined as permanent
        let r = make_ctx()
            .run_step("poison", json!({}), |_| async { panic!("kaboom") })
            .await;
        assert!(matches!(
            r,
            Err(Interrupt::Faulted(f)) if f.kind == crate::ErrorKind::Permanent
        ));

        let step = &store.list_steps(record.id).await.unwrap()[0];
        assert_eq!(step.panics, 2);
    }

    #[tokio::test]
    async fn status_is_not_clobbered_by_ctx_appends() {
        let (store, _clock, ctx) = ctx_fixture().await;

        ctx.checkpoint("begin").await.unwrap();

        let record = store.get_instance(ctx.instance_id()).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
    }
}
