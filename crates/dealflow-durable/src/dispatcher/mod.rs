//! Dispatcher
//!
//! Owns the run-queue of ready instances and the worker pool servicing
//! it. An instance is enqueued when it is created, when one of its waits
//! is satisfied, or when one of its timers fires. Workers serialise
//! per-instance execution through store leases; parallelism across
//! instances is bounded only by the worker count.

use std::sync::Arc;

use chrono::TimeDelta;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::StepFailure;
use crate::instance::{
    InstanceRecord, InstanceStatus, LogEntryKind, PendingTimer, TimerPurpose,
};
use crate::persistence::{InstanceStore, StoreError, WaitOutcome};
use crate::runtime::{Interrupt, StepContext};
use crate::workflow::{DefinitionCatalog, StateSpec, Transition, WorkflowDefinition};

/// Errors from dispatch operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown workflow kind: {0}")]
    UnknownKind(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("instance {0} is terminal")]
    AlreadyTerminal(Uuid),

    #[error("idempotency key {key:?} already maps to instance {existing}")]
    DuplicateIdempotencyKey { key: String, existing: Uuid },

    #[error("invalid input: {0}")]
    InvalidInput(StepFailure),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct DispatcherInner {
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    catalog: Arc<DefinitionCatalog>,
    config: Arc<EngineConfig>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    /// Ids currently enqueued, for wake deduplication
    queued: DashMap<Uuid, ()>,
}

/// The dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        catalog: Arc<DefinitionCatalog>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                clock,
                catalog,
                config,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                queued: DashMap::new(),
            }),
        }
    }

    /// Create an instance of the newest registered version of `kind`
    #[instrument(skip(self, input, idempotency_key))]
    pub async fn start_instance(
        &self,
        kind: &str,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Uuid, DispatchError> {
        let inner = &self.inner;
        let definition = inner
            .catalog
            .latest(kind)
            .ok_or_else(|| DispatchError::UnknownKind(kind.to_string()))?;

        definition
            .validate_input(&input)
            .map_err(DispatchError::InvalidInput)?;

        if let Some(key) = &idempotency_key {
            if let Some(existing) = inner.store.lookup_idempotency_key(key).await? {
                return Err(DispatchError::DuplicateIdempotencyKey {
                    key: key.clone(),
                    existing,
                });
            }
        }

        let now = inner.clock.now();
        let id = Uuid::now_v7();
        let record = InstanceRecord::new(
            id,
            kind,
            definition.version(),
            definition.initial_state(),
            input,
            now,
        );

        inner
            .store
            .create_instance(&record, idempotency_key.as_deref())
            .await
            .map_err(|e| match e {
                StoreError::IdempotencyConflict { key, existing } => {
                    DispatchError::DuplicateIdempotencyKey { key, existing }
                }
                other => DispatchError::Store(other),
            })?;

        inner
            .store
            .append(
                id,
                now,
                vec![LogEntryKind::StateTransition {
                    from: None,
                    to: definition.initial_state().to_string(),
                }],
                &record,
            )
            .await?;

        schedule_state_timeout(inner, &record, &definition).await?;
        schedule_overall_timeout(inner, &record, &definition).await?;

        info!(instance_id = %id, kind, "instance created");
        self.enqueue(id);
        Ok(id)
    }

    /// Request cooperative cancellation
    ///
    /// The instance observes `Cancelled` at its next suspension point or
    /// step boundary; compensation handlers then run.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<(), DispatchError> {
        let accepted = self
            .inner
            .store
            .request_cancel(instance_id, reason, self.inner.clock.now())
            .await?;
        if !accepted {
            return Err(DispatchError::AlreadyTerminal(instance_id));
        }
        self.enqueue(instance_id);
        Ok(())
    }

    /// Put an instance on the run-queue (deduplicated)
    pub fn enqueue(&self, instance_id: Uuid) {
        if self.inner.queued.insert(instance_id, ()).is_none() {
            let _ = self.inner.queue_tx.send(instance_id);
        }
    }

    /// Act on a due timer, then wake the owning instance
    ///
    /// Removing the timer row first collapses the pump's at-least-once
    /// delivery to exactly-once handling.
    #[instrument(skip(self, timer), fields(timer_id = %timer.id))]
    pub async fn handle_due_timer(&self, timer: PendingTimer) -> Result<(), DispatchError> {
        let inner = &self.inner;
        let Some(timer) = inner.store.remove_timer(timer.id).await? else {
            return Ok(());
        };

        let record = match inner.store.get_instance(timer.instance_id).await {
            Ok(record) => record,
            Err(StoreError::InstanceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        let now = inner.clock.now();
        match timer.purpose {
            TimerPurpose::Sleep { step } => {
                if let Some(mut record_step) =
                    inner.store.get_step(timer.instance_id, &step).await?
                {
                    if !record_step.is_settled() {
                        record_step.settle_ok(serde_json::Value::Null, now);
                        inner.store.put_step(&record_step).await?;
                    }
                }
                inner
                    .store
                    .append(
                        timer.instance_id,
                        now,
                        vec![LogEntryKind::SleepFired { timer_id: timer.id }],
                        &record,
                    )
                    .await?;
                self.enqueue(timer.instance_id);
            }

            TimerPurpose::Retry { step } => {
                if let Some(mut record_step) =
                    inner.store.get_step(timer.instance_id, &step).await?
                {
                    if record_step.retry_pending {
                        record_step.retry_pending = false;
                        inner.store.put_step(&record_step).await?;
                    }
                }
                inner
                    .store
                    .append(
                        timer.instance_id,
                        now,
                        vec![LogEntryKind::SleepFired { timer_id: timer.id }],
                        &record,
                    )
                    .await?;
                self.enqueue(timer.instance_id);
            }

            TimerPurpose::WaitDeadline { wait_id } => {
                let wait = inner
                    .store
                    .list_waits(timer.instance_id)
                    .await?
                    .into_iter()
                    .find(|w| w.id == wait_id);
                let Some(wait) = wait else {
                    // The event won the race; nothing to time out
                    return Ok(());
                };

                // An event published at or before the deadline beats the
                // timer: check the late-subscriber queue first.
                let outcome = match inner
                    .store
                    .dequeue_event(&wait.event_name, wait.correlation_key.as_deref(), now)
                    .await?
                {
                    Some(queued) => WaitOutcome::Delivered(queued.payload),
                    None => WaitOutcome::Failed(StepFailure::timeout(format!(
                        "deadline elapsed waiting for {:?}",
                        wait.event_name
                    ))),
                };
                inner.store.complete_wait(wait_id, &outcome, now).await?;
                inner
                    .store
                    .append(
                        timer.instance_id,
                        now,
                        vec![LogEntryKind::SleepFired { timer_id: timer.id }],
                        &record,
                    )
                    .await?;
                self.enqueue(timer.instance_id);
            }

            TimerPurpose::StateTimeout { state, then } => {
                if record.state != state {
                    // Transitioned away before expiry
                    return Ok(());
                }
                let mut next = record.clone();
                next.state = then.clone();
                next.visit += 1;
                next.status = InstanceStatus::Running;
                inner
                    .store
                    .append(
                        timer.instance_id,
                        now,
                        vec![
                            LogEntryKind::SleepFired { timer_id: timer.id },
                            LogEntryKind::StateTransition {
                                from: Some(state),
                                to: then,
                            },
                        ],
                        &next,
                    )
                    .await?;

                clear_stale_work(inner, &next).await?;
                if let Some(definition) = lookup_definition(inner, &next) {
                    schedule_state_timeout(inner, &next, &definition).await?;
                }
                self.enqueue(timer.instance_id);
            }

            TimerPurpose::OverallTimeout { then } => match then {
                Some(target) => {
                    let mut next = record.clone();
                    next.state = target.clone();
                    next.visit += 1;
                    next.status = InstanceStatus::Running;
                    inner
                        .store
                        .append(
                            timer.instance_id,
                            now,
                            vec![
                                LogEntryKind::SleepFired { timer_id: timer.id },
                                LogEntryKind::StateTransition {
                                    from: Some(record.state.clone()),
                                    to: target,
                                },
                            ],
                            &next,
                        )
                        .await?;
                    clear_stale_work(inner, &next).await?;
                    self.enqueue(timer.instance_id);
                }
                None => {
                    let failure = StepFailure::timeout("instance overall timeout elapsed");
                    let mut next = record.clone();
                    next.pending_failure = Some(failure.clone());
                    inner
                        .store
                        .append(
                            timer.instance_id,
                            now,
                            vec![
                                LogEntryKind::SleepFired { timer_id: timer.id },
                                LogEntryKind::ErrorRaised { failure },
                            ],
                            &next,
                        )
                        .await?;
                    self.enqueue(timer.instance_id);
                }
            },
        }

        Ok(())
    }

    /// Process queued instances inline until the queue is empty
    ///
    /// Used by tests and embedded callers for deterministic turns; the
    /// background workers use [`spawn_workers`](Self::spawn_workers).
    pub async fn drain(&self) -> Result<u32, DispatchError> {
        let mut processed = 0;
        loop {
            let next = {
                let mut rx = self.inner.queue_rx.lock().await;
                rx.try_recv().ok()
            };
            let Some(instance_id) = next else {
                return Ok(processed);
            };
            self.inner.queued.remove(&instance_id);
            resume(&self.inner, instance_id, "drain").await?;
            processed += 1;
        }
    }

    /// Start the worker pool
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.worker_count)
            .map(|i| {
                let inner = self.inner.clone();
                let mut shutdown = shutdown.clone();
                let worker_id = format!("worker-{i}");
                tokio::spawn(async move {
                    info!(worker_id, "dispatcher worker started");
                    loop {
                        let next = {
                            let mut rx = inner.queue_rx.lock().await;
                            tokio::select! {
                                id = rx.recv() => id,
                                _ = shutdown.changed() => None,
                            }
                        };
                        let Some(instance_id) = next else { break };
                        if *shutdown.borrow() {
                            break;
                        }
                        inner.queued.remove(&instance_id);
                        if let Err(e) = resume(&inner, instance_id, &worker_id).await {
                            error!(worker_id, %instance_id, "resume failed: {e}");
                        }
                    }
                    info!(worker_id, "dispatcher worker stopped");
                })
            })
            .collect()
    }
}

// =============================================================================
// Resume machinery
// =============================================================================

/// Lease, run, release
async fn resume(
    inner: &Arc<DispatcherInner>,
    instance_id: Uuid,
    worker: &str,
) -> Result<(), DispatchError> {
    let now = inner.clock.now();
    let until = now
        + TimeDelta::from_std(inner.config.lease_duration).unwrap_or_else(|_| TimeDelta::MAX);

    if !inner
        .store
        .acquire_lease(instance_id, worker, until, now)
        .await?
    {
        // Another worker holds the lease; retry shortly
        debug!(%instance_id, worker, "lease busy, deferring");
        let tx = inner.queue_tx.clone();
        let queued = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if queued.queued.insert(instance_id, ()).is_none() {
                let _ = tx.send(instance_id);
            }
        });
        return Ok(());
    }

    let result = run_leased(inner, instance_id, worker).await;
    inner.store.release_lease(instance_id, worker).await?;
    result
}

/// Advance the instance until it parks or terminates
async fn run_leased(
    inner: &Arc<DispatcherInner>,
    instance_id: Uuid,
    worker: &str,
) -> Result<(), DispatchError> {
    let mut transitions: u32 = 0;

    loop {
        let record = match inner.store.get_instance(instance_id).await {
            Ok(record) => record,
            Err(StoreError::InstanceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        let Some(definition) = lookup_definition(inner, &record) else {
            let failure = StepFailure::permanent(format!(
                "no definition registered for kind {:?} version {:?}",
                record.kind, record.version
            ));
            finish_failed(inner, record, failure).await?;
            return Ok(());
        };

        // Injected failures and cancellations are handled before any
        // handler work: compensation, then terminal.
        if record.pending_failure.is_some() || record.cancel_requested.is_some() {
            finish_abnormally(inner, record, &definition).await?;
            return Ok(());
        }

        let Some(state_spec) = definition.state(&record.state).cloned() else {
            let failure = StepFailure::permanent(format!(
                "instance is in undeclared state {:?}",
                record.state
            ));
            finish_failed(inner, record, failure).await?;
            return Ok(());
        };

        if let Some(guard) = &state_spec.guard {
            if let Err(failure) = guard(&record.input) {
                raise_failure(inner, record, failure).await?;
                continue;
            }
        }

        if state_spec.terminal && state_spec.handler.is_none() {
            let output = serde_json::json!({ "finalState": record.state });
            finish_completed(inner, record, output).await?;
            return Ok(());
        }

        let mut running = record.clone();
        if running.status != InstanceStatus::Running {
            running.status = InstanceStatus::Running;
            inner
                .store
                .append(instance_id, inner.clock.now(), vec![], &running)
                .await?;
        }

        let handler = state_spec
            .handler
            .clone()
            .expect("non-terminal states always carry a handler");

        let ctx = StepContext::new(
            running.clone(),
            inner.store.clone(),
            inner.clock.clone(),
            inner.config.clone(),
            definition.default_retry().clone(),
            true,
            String::new(),
        );
        let usage = ctx.usage_handle();

        debug!(%instance_id, worker, state = %running.state, "entering state handler");
        let started = std::time::Instant::now();
        let outcome = handler(ctx).await;

        let mut delta = std::mem::take(&mut *usage.lock());
        delta.busy_ms += started.elapsed().as_millis() as u64;
        inner.store.add_usage(instance_id, &delta).await?;

        match outcome {
            Ok(Transition::Stay) | Err(Interrupt::Suspended(_)) => {
                park(inner, running).await?;
                return Ok(());
            }

            Ok(Transition::GoTo(next)) => {
                transitions += 1;
                if transitions > inner.config.max_transitions_per_resume {
                    let failure = StepFailure::permanent(format!(
                        "exceeded {} transitions in one resume; probable cycle",
                        inner.config.max_transitions_per_resume
                    ));
                    raise_failure(inner, running, failure).await?;
                    continue;
                }

                let Some(next_spec) = definition.state(&next) else {
                    let failure = StepFailure::permanent(format!(
                        "transition targets undeclared state {next:?}"
                    ));
                    raise_failure(inner, running, failure).await?;
                    continue;
                };

                apply_transition(inner, &mut running, &next).await?;
                if let Some(timeout) = &next_spec.timeout {
                    let timer = PendingTimer {
                        id: Uuid::now_v7(),
                        instance_id,
                        fire_at: inner.clock.now()
                            + TimeDelta::from_std(timeout.after)
                                .unwrap_or_else(|_| TimeDelta::MAX),
                        purpose: TimerPurpose::StateTimeout {
                            state: next.clone(),
                            then: timeout.then.clone(),
                        },
                    };
                    inner.store.put_timer(&timer).await?;
                }
            }

            Ok(Transition::Complete(output)) => {
                finish_completed(inner, running, output).await?;
                return Ok(());
            }

            Ok(Transition::Fail(failure)) | Err(Interrupt::Faulted(failure)) => {
                if failure.is_cancellation() {
                    // Loop re-reads the record and takes the cancel path
                    continue;
                }
                raise_failure(inner, running, failure).await?;
            }
        }
    }
}

fn lookup_definition(
    inner: &DispatcherInner,
    record: &InstanceRecord,
) -> Option<Arc<WorkflowDefinition>> {
    inner
        .catalog
        .lookup(&record.kind, &record.version)
        .or_else(|| inner.catalog.latest(&record.kind))
}

async fn schedule_state_timeout(
    inner: &DispatcherInner,
    record: &InstanceRecord,
    definition: &WorkflowDefinition,
) -> Result<(), StoreError> {
    let Some(StateSpec {
        timeout: Some(timeout),
        ..
    }) = definition.state(&record.state)
    else {
        return Ok(());
    };

    let timer = PendingTimer {
        id: Uuid::now_v7(),
        instance_id: record.id,
        fire_at: inner.clock.now()
            + TimeDelta::from_std(timeout.after).unwrap_or_else(|_| TimeDelta::MAX),
        purpose: TimerPurpose::StateTimeout {
            state: record.state.clone(),
            then: timeout.then.clone(),
        },
    };
    inner.store.put_timer(&timer).await
}

async fn schedule_overall_timeout(
    inner: &DispatcherInner,
    record: &InstanceRecord,
    definition: &WorkflowDefinition,
) -> Result<(), StoreError> {
    let (after, then) = match definition.overall_timeout() {
        Some(overall) => (overall.after, overall.then.clone()),
        None => match inner.config.instance_overall_timeout {
            Some(after) => (after, None),
            None => return Ok(()),
        },
    };

    let timer = PendingTimer {
        id: Uuid::now_v7(),
        instance_id: record.id,
        fire_at: inner.clock.now() + TimeDelta::from_std(after).unwrap_or_else(|_| TimeDelta::MAX),
        purpose: TimerPurpose::OverallTimeout { then },
    };
    inner.store.put_timer(&timer).await
}

/// Drop work left behind by a forced transition: waits registered by the
/// abandoned state visit would otherwise swallow later events, and its
/// sleep/retry timers would wake a state that no longer exists. The
/// overall-timeout timer and timers for the newly entered state survive.
async fn clear_stale_work(
    inner: &DispatcherInner,
    record: &InstanceRecord,
) -> Result<(), StoreError> {
    let now = inner.clock.now();

    for wait in inner.store.list_waits(record.id).await? {
        inner
            .store
            .complete_wait(
                wait.id,
                &WaitOutcome::Failed(StepFailure::timeout(format!(
                    "state {:?} timed out before {:?} arrived",
                    record.state, wait.event_name
                ))),
                now,
            )
            .await?;
    }

    for timer in inner.store.list_timers(record.id).await? {
        let keep = match &timer.purpose {
            TimerPurpose::OverallTimeout { .. } => true,
            TimerPurpose::StateTimeout { state, .. } => state == &record.state,
            _ => false,
        };
        if !keep {
            inner.store.remove_timer(timer.id).await?;
        }
    }
    Ok(())
}

/// Record a state transition and cancel the left state's timeout timers
async fn apply_transition(
    inner: &DispatcherInner,
    record: &mut InstanceRecord,
    next: &str,
) -> Result<(), StoreError> {
    let from = record.state.clone();

    for timer in inner.store.list_timers(record.id).await? {
        if matches!(&timer.purpose, TimerPurpose::StateTimeout { state, .. } if state == &from) {
            inner.store.remove_timer(timer.id).await?;
        }
    }

    record.state = next.to_string();
    record.visit += 1;
    record.status = InstanceStatus::Running;
    inner
        .store
        .append(
            record.id,
            inner.clock.now(),
            vec![LogEntryKind::StateTransition {
                from: Some(from.clone()),
                to: next.to_string(),
            }],
            record,
        )
        .await?;

    debug!(instance_id = %record.id, %from, to = %next, "state transition");
    Ok(())
}

/// Park the instance until the next wake
async fn park(inner: &DispatcherInner, mut record: InstanceRecord) -> Result<(), StoreError> {
    record.status = InstanceStatus::Suspended;
    inner
        .store
        .append(record.id, inner.clock.now(), vec![], &record)
        .await?;
    Ok(())
}

/// Surface an uncaught failure; the next loop iteration compensates
async fn raise_failure(
    inner: &DispatcherInner,
    mut record: InstanceRecord,
    failure: StepFailure,
) -> Result<(), StoreError> {
    warn!(instance_id = %record.id, state = %record.state, %failure, "instance failure raised");
    record.pending_failure = Some(failure.clone());
    inner
        .store
        .append(
            record.id,
            inner.clock.now(),
            vec![LogEntryKind::ErrorRaised { failure }],
            &record,
        )
        .await?;
    Ok(())
}

/// Run the failing state's compensation, then settle the terminal status
async fn finish_abnormally(
    inner: &Arc<DispatcherInner>,
    record: InstanceRecord,
    definition: &WorkflowDefinition,
) -> Result<(), DispatchError> {
    if let Some(compensation) = definition
        .state(&record.state)
        .and_then(|s| s.compensation.clone())
    {
        // Compensations are memoized steps and may themselves suspend
        // (e.g. on a retry backoff); cancellation is not observed inside.
        let ctx = StepContext::new(
            record.clone(),
            inner.store.clone(),
            inner.clock.clone(),
            inner.config.clone(),
            definition.default_retry().clone(),
            false,
            format!("comp:{}/", record.state),
        );
        let usage = ctx.usage_handle();
        let outcome = compensation(ctx).await;
        let delta = std::mem::take(&mut *usage.lock());
        inner.store.add_usage(record.id, &delta).await?;

        match outcome {
            Ok(()) => {}
            Err(Interrupt::Suspended(_)) => {
                park(inner, record).await?;
                return Ok(());
            }
            Err(Interrupt::Faulted(failure)) => {
                warn!(
                    instance_id = %record.id,
                    state = %record.state,
                    %failure,
                    "compensation handler failed; proceeding to terminal state"
                );
            }
        }
    }

    let mut record = record;
    match record.pending_failure.take() {
        Some(failure) if !failure.is_cancellation() => {
            settle_terminal(inner, &mut record, InstanceStatus::Failed, None, Some(failure))
                .await?;
        }
        _ => {
            let reason = record
                .cancel_requested
                .clone()
                .unwrap_or_else(|| "cancelled".to_string());
            settle_terminal(
                inner,
                &mut record,
                InstanceStatus::Cancelled,
                None,
                Some(StepFailure::cancelled(reason)),
            )
            .await?;
        }
    }
    Ok(())
}

/// Fail without compensation (definition-level defects)
async fn finish_failed(
    inner: &DispatcherInner,
    mut record: InstanceRecord,
    failure: StepFailure,
) -> Result<(), StoreError> {
    error!(instance_id = %record.id, %failure, "instance failed");
    inner
        .store
        .append(
            record.id,
            inner.clock.now(),
            vec![LogEntryKind::ErrorRaised {
                failure: failure.clone(),
            }],
            &record,
        )
        .await?;
    settle_terminal(inner, &mut record, InstanceStatus::Failed, None, Some(failure)).await
}

async fn finish_completed(
    inner: &DispatcherInner,
    mut record: InstanceRecord,
    output: serde_json::Value,
) -> Result<(), StoreError> {
    info!(instance_id = %record.id, state = %record.state, "instance completed");
    settle_terminal(inner, &mut record, InstanceStatus::Completed, Some(output), None).await
}

/// Append the terminal entry, update the record, drop pending work
async fn settle_terminal(
    inner: &DispatcherInner,
    record: &mut InstanceRecord,
    status: InstanceStatus,
    output: Option<serde_json::Value>,
    failure: Option<StepFailure>,
) -> Result<(), StoreError> {
    record.status = status;
    record.output = output.clone();
    record.failure = failure.clone();
    record.pending_failure = None;

    inner
        .store
        .append(
            record.id,
            inner.clock.now(),
            vec![LogEntryKind::Terminal {
                status,
                output,
                failure,
            }],
            record,
        )
        .await?;
    inner.store.clear_pending(record.id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::persistence::MemoryInstanceStore;
    use crate::workflow::{StateSpec, WorkflowDefinition};
    use crate::MockClock;
    use serde_json::json;
    use std::time::Duration;

    fn two_step_kind() -> WorkflowDefinition {
        WorkflowDefinition::builder("two_step", "v1")
            .initial("First")
            .event("go")
            .state(StateSpec::new("First").on_enter(|ctx| async move {
                ctx.run_step("first_work", json!({}), |_| async { Ok(json!("one")) })
                    .await?;
                Ok(Transition::go("Second"))
            }))
            .state(StateSpec::new("Second").on_enter(|ctx| async move {
                let payload = ctx.wait_for_event("go", None, None).await?;
                Ok(Transition::Complete(json!({ "got": payload })))
            }))
            .state(StateSpec::terminal("Done"))
            .build()
            .unwrap()
    }

    async fn fixture(
        definition: WorkflowDefinition,
    ) -> (Arc<MemoryInstanceStore>, Arc<MockClock>, Dispatcher) {
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = MockClock::from_system();
        let catalog = DefinitionCatalog::new();
        catalog.register(definition).unwrap();
        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn InstanceStore>,
            clock.clone() as Arc<dyn Clock>,
            Arc::new(catalog),
            Arc::new(EngineConfig::default()),
        );
        (store, clock, dispatcher)
    }

    #[tokio::test]
    async fn instance_runs_to_suspension() {
        let (store, _clock, dispatcher) = fixture(two_step_kind()).await;

        let id = dispatcher
            .start_instance("two_step", json!({}), None)
            .await
            .unwrap();
        dispatcher.drain().await.unwrap();

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.state, "Second");
        assert_eq!(record.status, InstanceStatus::Suspended);
        assert_eq!(store.wait_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let (_store, _clock, dispatcher) = fixture(two_step_kind()).await;
        let result = dispatcher.start_instance("nope", json!({}), None).await;
        assert!(matches!(result, Err(DispatchError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn idempotency_key_returns_conflict() {
        let (_store, _clock, dispatcher) = fixture(two_step_kind()).await;

        let first = dispatcher
            .start_instance("two_step", json!({}), Some("create-1".into()))
            .await
            .unwrap();
        let result = dispatcher
            .start_instance("two_step", json!({}), Some("create-1".into()))
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::DuplicateIdempotencyKey { existing, .. }) if existing == first
        ));
    }

    #[tokio::test]
    async fn cancel_of_terminal_instance_conflicts() {
        let (store, _clock, dispatcher) = fixture(
            WorkflowDefinition::builder("quick", "v1")
                .initial("Only")
                .state(StateSpec::new("Only").on_enter(|_| async move {
                    Ok(Transition::Complete(json!({"ok": true})))
                }))
                .state(StateSpec::terminal("Done"))
                .build()
                .unwrap(),
        )
        .await;

        let id = dispatcher
            .start_instance("quick", json!({}), None)
            .await
            .unwrap();
        dispatcher.drain().await.unwrap();

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.output, Some(json!({"ok": true})));

        let result = dispatcher.cancel(id, "too late").await;
        assert!(matches!(result, Err(DispatchError::AlreadyTerminal(_))));
    }

    #[tokio::test]
    async fn guard_violation_fails_instance() {
        let (store, _clock, dispatcher) = fixture(
            WorkflowDefinition::builder("guarded", "v1")
                .initial("Checked")
                .state(
                    StateSpec::new("Checked")
                        .guard(|input| {
                            input
                                .get("allowed")
                                .and_then(|v| v.as_bool())
                                .filter(|allowed| *allowed)
                                .map(|_| ())
                                .ok_or_else(|| StepFailure::guard("not allowed"))
                        })
                        .on_enter(|_| async move { Ok(Transition::Complete(json!({}))) }),
                )
                .state(StateSpec::terminal("Done"))
                .build()
                .unwrap(),
        )
        .await;

        let id = dispatcher
            .start_instance("guarded", json!({"allowed": false}), None)
            .await
            .unwrap();
        dispatcher.drain().await.unwrap();

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Failed);
        assert_eq!(record.failure.as_ref().unwrap().kind, ErrorKind::Guard);
    }

    #[tokio::test]
    async fn state_timeout_forces_transition() {
        let (store, clock, dispatcher) = fixture(
            WorkflowDefinition::builder("timed", "v1")
                .initial("Waiting")
                .event("never")
                .state(
                    StateSpec::new("Waiting")
                        .on_enter(|ctx| async move {
                            ctx.wait_for_event("never", None, None).await?;
                            Ok(Transition::go("Done"))
                        })
                        .timeout(Duration::from_secs(60), "Expired"),
                )
                .state(StateSpec::terminal("Done"))
                .state(StateSpec::terminal("Expired"))
                .build()
                .unwrap(),
        )
        .await;

        let id = dispatcher
            .start_instance("timed", json!({}), None)
            .await
            .unwrap();
        dispatcher.drain().await.unwrap();

        clock.advance(Duration::from_secs(61));
        for timer in store.due_timers(clock.now(), 16).await.unwrap() {
            dispatcher.handle_due_timer(timer).await.unwrap();
        }
        dispatcher.drain().await.unwrap();

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.output, Some(json!({"finalState": "Expired"})));
    }

    #[tokio::test]
    async fn terminal_instance_has_no_pending_work() {
        let (store, _clock, dispatcher) = fixture(two_step_kind()).await;

        let id = dispatcher
            .start_instance("two_step", json!({}), None)
            .await
            .unwrap();
        dispatcher.drain().await.unwrap();
        dispatcher.cancel(id, "cleanup test").await.unwrap();
        dispatcher.drain().await.unwrap();

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Cancelled);
        assert_eq!(store.wait_count(), 0);
        assert_eq!(store.timer_count(), 0);
    }
}
