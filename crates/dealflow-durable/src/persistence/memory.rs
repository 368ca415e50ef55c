//! In-memory implementation of InstanceStore
//!
//! Backs tests and single-node evaluation. Per-instance data lives under
//! one lock so the log-append/materialised-update and wait-completion
//! contracts hold trivially; semantics match the PostgreSQL
//! implementation.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::error::ErrorKind;
use crate::instance::{
    DeadLetterEntry, InstanceRecord, Lease, LogEntry, LogEntryKind, PendingTimer, PendingWait,
    QueuedEvent, ResourceUsage, Snapshot, SnapshotInfo, StepKey, StepRecord,
};

/// Everything an instance owns
struct InstanceData {
    record: InstanceRecord,
    log: Vec<LogEntry>,
    steps: HashMap<StepKey, StepRecord>,
    usage: ResourceUsage,
}

/// In-memory store
///
/// # Example
///
/// ```
/// use dealflow_durable::MemoryInstanceStore;
///
/// let store = MemoryInstanceStore::new();
/// ```
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, InstanceData>>,
    timers: RwLock<HashMap<Uuid, PendingTimer>>,
    waits: RwLock<HashMap<Uuid, PendingWait>>,
    queued_events: RwLock<HashMap<String, VecDeque<QueuedEvent>>>,
    spilled_events: RwLock<Vec<SpilledEvent>>,
    publisher_keys: RwLock<HashMap<String, DateTime<Utc>>>,
    idempotency_keys: RwLock<HashMap<String, Uuid>>,
    leases: RwLock<HashMap<Uuid, Lease>>,
    dlq: RwLock<HashMap<Uuid, DeadLetterEntry>>,
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            waits: RwLock::new(HashMap::new()),
            queued_events: RwLock::new(HashMap::new()),
            spilled_events: RwLock::new(Vec::new()),
            publisher_keys: RwLock::new(HashMap::new()),
            idempotency_keys: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            dlq: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Number of pending waits across all instances
    pub fn wait_count(&self) -> usize {
        self.waits.read().len()
    }

    /// Number of pending timers across all instances
    pub fn timer_count(&self) -> usize {
        self.timers.read().len()
    }

    fn append_locked(
        data: &mut InstanceData,
        at: DateTime<Utc>,
        entries: Vec<LogEntryKind>,
        update: &InstanceRecord,
    ) -> Vec<LogEntry> {
        let sticky_cancel = data.record.cancel_requested.clone();
        let sticky_failure = data.record.pending_failure.clone();
        let mut next = update.clone();
        if next.cancel_requested.is_none() {
            next.cancel_requested = sticky_cancel;
        }
        // Injected failures survive stale record copies until a terminal
        // write settles them
        if next.pending_failure.is_none() && !next.status.is_terminal() {
            next.pending_failure = sticky_failure;
        }
        next.last_activity_at = at;
        data.record = next;

        let mut stamped = Vec::with_capacity(entries.len());
        for kind in entries {
            let entry = LogEntry {
                ordinal: data.log.len() as u64,
                at,
                kind,
            };
            data.log.push(entry.clone());
            stamped.push(entry);
        }
        stamped
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn create_instance(
        &self,
        record: &InstanceRecord,
        idempotency_key: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(key) = idempotency_key {
            let mut keys = self.idempotency_keys.write();
            if let Some(existing) = keys.get(key) {
                return Err(StoreError::IdempotencyConflict {
                    key: key.to_string(),
                    existing: *existing,
                });
            }
            keys.insert(key.to_string(), record.id);
        }

        let mut instances = self.instances.write();
        if instances.contains_key(&record.id) {
            return Err(StoreError::DuplicateInstance(record.id));
        }
        instances.insert(
            record.id,
            InstanceData {
                record: record.clone(),
                log: Vec::new(),
                steps: HashMap::new(),
                usage: ResourceUsage::default(),
            },
        );
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StoreError> {
        self.instances
            .read()
            .get(&instance_id)
            .map(|d| d.record.clone())
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn list_active(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|d| d.record.status.is_active())
            .map(|d| d.record.clone())
            .collect())
    }

    async fn list_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<InstanceRecord>, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|d| d.record.status.is_active() && d.record.last_activity_at < cutoff)
            .map(|d| d.record.clone())
            .collect())
    }

    async fn lookup_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.idempotency_keys.read().get(key).copied())
    }

    async fn append(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
        entries: Vec<LogEntryKind>,
        update: &InstanceRecord,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut instances = self.instances.write();
        let data = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        Ok(Self::append_locked(data, at, entries, update))
    }

    async fn read_log(
        &self,
        instance_id: Uuid,
        from_ordinal: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let instances = self.instances.read();
        let data = instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        Ok(data
            .log
            .iter()
            .skip(from_ordinal as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn log_head(&self, instance_id: Uuid) -> Result<u64, StoreError> {
        let instances = self.instances.read();
        let data = instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        Ok(data.log.len() as u64)
    }

    async fn request_cancel(
        &self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut instances = self.instances.write();
        let data = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        if data.record.status.is_terminal() {
            return Ok(false);
        }
        if data.record.cancel_requested.is_none() {
            data.record.cancel_requested = Some(reason.to_string());
            let entry = LogEntry {
                ordinal: data.log.len() as u64,
                at,
                kind: LogEntryKind::CancelRequested {
                    reason: reason.to_string(),
                },
            };
            data.log.push(entry);
            data.record.last_activity_at = at;
        }
        Ok(true)
    }

    async fn get_step(
        &self,
        instance_id: Uuid,
        key: &StepKey,
    ) -> Result<Option<StepRecord>, StoreError> {
        let instances = self.instances.read();
        let data = instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        Ok(data.steps.get(key).cloned())
    }

    async fn put_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let data = instances
            .get_mut(&record.instance_id)
            .ok_or(StoreError::InstanceNotFound(record.instance_id))?;
        data.steps.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn list_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let instances = self.instances.read();
        let data = instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        let mut steps: Vec<_> = data.steps.values().cloned().collect();
        steps.sort_by(|a, b| a.key.ordinal.cmp(&b.key.ordinal));
        Ok(steps)
    }

    async fn reset_step_errors(
        &self,
        instance_id: Uuid,
        kinds: &[ErrorKind],
    ) -> Result<u32, StoreError> {
        let mut instances = self.instances.write();
        let data = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        let mut reset = 0;
        for step in data.steps.values_mut() {
            if let Some(error) = &step.error {
                if kinds.contains(&error.kind) {
                    step.error = None;
                    step.attempts = 0;
                    step.retry_pending = false;
                    step.ended_at = None;
                    reset += 1;
                }
            }
        }
        Ok(reset)
    }

    async fn put_timer(&self, timer: &PendingTimer) -> Result<(), StoreError> {
        self.timers.write().insert(timer.id, timer.clone());
        Ok(())
    }

    async fn remove_timer(&self, timer_id: Uuid) -> Result<Option<PendingTimer>, StoreError> {
        Ok(self.timers.write().remove(&timer_id))
    }

    async fn list_timers(&self, instance_id: Uuid) -> Result<Vec<PendingTimer>, StoreError> {
        let mut timers: Vec<_> = self
            .timers
            .read()
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect();
        timers.sort_by_key(|t| t.fire_at);
        Ok(timers)
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTimer>, StoreError> {
        let mut due: Vec<_> = self
            .timers
            .read()
            .values()
            .filter(|t| t.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.fire_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn put_wait(&self, wait: &PendingWait) -> Result<(), StoreError> {
        self.waits.write().insert(wait.id, wait.clone());
        Ok(())
    }

    async fn list_waits(&self, instance_id: Uuid) -> Result<Vec<PendingWait>, StoreError> {
        let mut waits: Vec<_> = self
            .waits
            .read()
            .values()
            .filter(|w| w.instance_id == instance_id)
            .cloned()
            .collect();
        waits.sort_by_key(|w| w.registered_at);
        Ok(waits)
    }

    async fn find_wait(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        instance_id: Option<Uuid>,
    ) -> Result<Option<PendingWait>, StoreError> {
        Ok(self
            .waits
            .read()
            .values()
            .filter(|w| w.matches(event_name, correlation_key))
            .filter(|w| instance_id.map_or(true, |id| w.instance_id == id))
            .min_by_key(|w| w.registered_at)
            .cloned())
    }

    async fn complete_wait(
        &self,
        wait_id: Uuid,
        outcome: &WaitOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<PendingWait>, StoreError> {
        // Wait removal, step settlement and the arrival entry happen under
        // the instance lock, making delivery exactly-once.
        let wait = match self.waits.write().remove(&wait_id) {
            Some(wait) => wait,
            None => return Ok(None),
        };

        let mut instances = self.instances.write();
        let data = instances
            .get_mut(&wait.instance_id)
            .ok_or(StoreError::InstanceNotFound(wait.instance_id))?;

        let step = data
            .steps
            .entry(wait.step.clone())
            .or_insert_with(|| StepRecord::open(wait.instance_id, wait.step.clone(), at));

        match outcome {
            WaitOutcome::Delivered(payload) => {
                step.settle_ok(payload.clone(), at);

                let mut kinds = vec![LogEntryKind::EventArrived {
                    wait_id: wait.id,
                    event: wait.event_name.clone(),
                    correlation_key: wait.correlation_key.clone(),
                    payload: payload.clone(),
                }];
                if wait.approval.is_some() {
                    kinds.push(LogEntryKind::ReviewResponded {
                        step: wait.step.clone(),
                        approved: payload
                            .get("approved")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                        payload: payload.clone(),
                    });
                }
                for kind in kinds {
                    let entry = LogEntry {
                        ordinal: data.log.len() as u64,
                        at,
                        kind,
                    };
                    data.log.push(entry);
                }
                data.usage.events_consumed += 1;
            }
            WaitOutcome::Failed(failure) => {
                step.settle_err(failure.clone(), at);
            }
        }
        data.record.last_activity_at = at;

        Ok(Some(wait))
    }

    async fn clear_pending(&self, instance_id: Uuid) -> Result<(), StoreError> {
        self.waits.write().retain(|_, w| w.instance_id != instance_id);
        self.timers
            .write()
            .retain(|_, t| t.instance_id != instance_id);
        Ok(())
    }

    async fn enqueue_event(
        &self,
        event: &QueuedEvent,
        max_per_name: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut queues = self.queued_events.write();
        let queue = queues.entry(event.name.clone()).or_default();
        queue.push_back(event.clone());

        if queue.len() > max_per_name {
            let oldest = queue.pop_front().expect("queue cannot be empty here");
            self.spilled_events.write().push(SpilledEvent {
                id: Uuid::now_v7(),
                event: oldest,
                spilled_at: event.published_at,
            });
            return Ok(EnqueueOutcome::SpilledOldest);
        }
        Ok(EnqueueOutcome::Queued)
    }

    async fn dequeue_event(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedEvent>, StoreError> {
        let mut queues = self.queued_events.write();
        let Some(queue) = queues.get_mut(event_name) else {
            return Ok(None);
        };

        let position = queue.iter().position(|e| {
            e.expires_at > now
                && match correlation_key {
                    Some(key) => e.correlation_key.as_deref() == Some(key),
                    None => true,
                }
        });
        Ok(position.and_then(|i| queue.remove(i)))
    }

    async fn expire_events(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0;
        let mut queues = self.queued_events.write();
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|e| e.expires_at > now);
            removed += (before - queue.len()) as u64;
        }
        queues.retain(|_, q| !q.is_empty());
        Ok(removed)
    }

    async fn list_spilled_events(&self, limit: usize) -> Result<Vec<SpilledEvent>, StoreError> {
        let spilled = self.spilled_events.read();
        Ok(spilled.iter().rev().take(limit).cloned().collect())
    }

    async fn record_publisher_key(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut keys = self.publisher_keys.write();
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), at);
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        instance_id: Uuid,
        worker: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.write();
        match leases.get(&instance_id) {
            Some(lease) if lease.expires_at > now && lease.worker != worker => Ok(false),
            _ => {
                leases.insert(
                    instance_id,
                    Lease {
                        worker: worker.to_string(),
                        expires_at: until,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, instance_id: Uuid, worker: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.write();
        if leases
            .get(&instance_id)
            .map_or(false, |l| l.worker == worker)
        {
            leases.remove(&instance_id);
        }
        Ok(())
    }

    async fn get_lease(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.leases.read().get(&instance_id).cloned())
    }

    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.dlq.write().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn list_dead_letter(
        &self,
        filter: &DlqFilter,
        page: &Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let dlq = self.dlq.read();
        let mut entries: Vec<_> = dlq
            .values()
            .filter(|e| {
                filter.instance_id.map_or(true, |id| e.instance_id == id)
                    && filter.reason.as_ref().map_or(true, |r| &e.reason == r)
            })
            .cloned()
            .collect();

        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(entries
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn take_dead_letter(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.dlq.write().remove(&entry_id))
    }

    async fn purge_dead_letter(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut dlq = self.dlq.write();
        let before = dlq.len();
        dlq.retain(|_, e| e.failed_at >= cutoff);
        Ok((before - dlq.len()) as u64)
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.snapshots.write().insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots.read().get(&snapshot_id).cloned())
    }

    async fn list_snapshots(&self, instance_id: Uuid) -> Result<Vec<SnapshotInfo>, StoreError> {
        let snapshots = self.snapshots.read();
        let mut infos: Vec<SnapshotInfo> = snapshots
            .values()
            .filter(|s| s.instance_id == instance_id)
            .map(SnapshotInfo::from)
            .collect();
        infos.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(infos)
    }

    async fn purge_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut snapshots = self.snapshots.write();
        let before = snapshots.len();
        snapshots.retain(|_, s| s.taken_at >= cutoff);
        Ok((before - snapshots.len()) as u64)
    }

    async fn import_instance(
        &self,
        record: &InstanceRecord,
        log: Vec<LogEntry>,
        steps: Vec<StepRecord>,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(&record.id) {
            return Err(StoreError::DuplicateInstance(record.id));
        }
        instances.insert(
            record.id,
            InstanceData {
                record: record.clone(),
                log,
                steps: steps.into_iter().map(|s| (s.key.clone(), s)).collect(),
                usage: ResourceUsage::default(),
            },
        );
        Ok(())
    }

    async fn purge_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut instances = self.instances.write();
        let purged: Vec<Uuid> = instances
            .iter()
            .filter(|(_, d)| d.record.status.is_terminal() && d.record.last_activity_at < cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &purged {
            instances.remove(id);
        }
        drop(instances);

        for id in &purged {
            self.waits.write().retain(|_, w| &w.instance_id != id);
            self.timers.write().retain(|_, t| &t.instance_id != id);
        }
        Ok(purged.len() as u64)
    }

    async fn add_usage(
        &self,
        instance_id: Uuid,
        delta: &ResourceUsage,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let data = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        data.usage.absorb(delta);
        Ok(())
    }

    async fn get_usage(&self, instance_id: Uuid) -> Result<ResourceUsage, StoreError> {
        let instances = self.instances.read();
        let data = instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        Ok(data.usage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: Uuid) -> InstanceRecord {
        InstanceRecord::new(id, "test_kind", "v1", "Start", json!({}), Utc::now())
    }

    #[tokio::test]
    async fn create_and_get_instance() {
        let store = MemoryInstanceStore::new();
        let id = Uuid::now_v7();

        store.create_instance(&record(id), None).await.unwrap();

        let fetched = store.get_instance(id).await.unwrap();
        assert_eq!(fetched.kind, "test_kind");
        assert_eq!(fetched.state, "Start");
    }

    #[tokio::test]
    async fn idempotency_key_conflict() {
        let store = MemoryInstanceStore::new();
        let first = Uuid::now_v7();
        store
            .create_instance(&record(first), Some("key-1"))
            .await
            .unwrap();

        let result = store
            .create_instance(&record(Uuid::now_v7()), Some("key-1"))
            .await;

        assert!(matches!(
            result,
            Err(StoreError::IdempotencyConflict { existing, .. }) if existing == first
        ));
    }

    #[tokio::test]
    async fn append_stamps_ordinals() {
        let store = MemoryInstanceStore::new();
        let id = Uuid::now_v7();
        let rec = record(id);
        store.create_instance(&rec, None).await.unwrap();

        let entries = store
            .append(
                id,
                Utc::now(),
                vec![
                    LogEntryKind::StateTransition {
                        from: None,
                        to: "Start".into(),
                    },
                    LogEntryKind::Checkpoint {
                        label: "begin".into(),
                    },
                ],
                &rec,
            )
            .await
            .unwrap();

        assert_eq!(entries[0].ordinal, 0);
        assert_eq!(entries[1].ordinal, 1);
        assert_eq!(store.log_head(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_mark_is_sticky_across_appends() {
        let store = MemoryInstanceStore::new();
        let id = Uuid::now_v7();
        let rec = record(id);
        store.create_instance(&rec, None).await.unwrap();

        assert!(store.request_cancel(id, "operator", Utc::now()).await.unwrap());

        // A stale record without the mark does not clear it
        store.append(id, Utc::now(), vec![], &rec).await.unwrap();

        let fetched = store.get_instance(id).await.unwrap();
        assert_eq!(fetched.cancel_requested.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn wait_delivery_settles_step_and_logs_arrival() {
        let store = MemoryInstanceStore::new();
        let id = Uuid::now_v7();
        store.create_instance(&record(id), None).await.unwrap();

        let wait = PendingWait {
            id: Uuid::now_v7(),
            instance_id: id,
            event_name: "qualify".into(),
            correlation_key: None,
            deadline: None,
            step: StepKey::compose("wait:qualify", 0, 0),
            approval: None,
            registered_at: Utc::now(),
        };
        store.put_wait(&wait).await.unwrap();

        let found = store.find_wait("qualify", None, None).await.unwrap();
        assert_eq!(found.as_ref().map(|w| w.id), Some(wait.id));

        let completed = store
            .complete_wait(
                wait.id,
                &WaitOutcome::Delivered(json!({"qualified": true})),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(completed.is_some());

        // Second completion is a no-op: delivery is exactly-once
        let again = store
            .complete_wait(wait.id, &WaitOutcome::Delivered(json!({})), Utc::now())
            .await
            .unwrap();
        assert!(again.is_none());

        let step = store.get_step(id, &wait.step).await.unwrap().unwrap();
        assert_eq!(step.output, Some(json!({"qualified": true})));

        let log = store.read_log(id, 0, 10).await.unwrap();
        assert!(matches!(
            &log[0].kind,
            LogEntryKind::EventArrived { event, .. } if event == "qualify"
        ));
    }

    #[tokio::test]
    async fn queue_overflow_spills_oldest() {
        let store = MemoryInstanceStore::new();
        let now = Utc::now();
        let event = |i: u32| QueuedEvent {
            id: Uuid::now_v7(),
            name: "payment_received".into(),
            correlation_key: Some(format!("deal-{i}")),
            payload: json!({}),
            published_at: now,
            expires_at: now + chrono::TimeDelta::try_hours(1).unwrap(),
        };

        assert_eq!(
            store.enqueue_event(&event(0), 2).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            store.enqueue_event(&event(1), 2).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            store.enqueue_event(&event(2), 2).await.unwrap(),
            EnqueueOutcome::SpilledOldest
        );

        let spilled = store.list_spilled_events(10).await.unwrap();
        assert_eq!(spilled.len(), 1);
        assert_eq!(spilled[0].event.correlation_key.as_deref(), Some("deal-0"));
    }

    #[tokio::test]
    async fn lease_exclusivity_and_expiry() {
        let store = MemoryInstanceStore::new();
        let id = Uuid::now_v7();
        let now = Utc::now();
        let soon = now + chrono::TimeDelta::try_seconds(30).unwrap();

        assert!(store.acquire_lease(id, "w1", soon, now).await.unwrap());
        assert!(!store.acquire_lease(id, "w2", soon, now).await.unwrap());
        // Re-entrant for the same worker
        assert!(store.acquire_lease(id, "w1", soon, now).await.unwrap());

        // After expiry another worker may claim
        let later = soon + chrono::TimeDelta::try_seconds(1).unwrap();
        assert!(store
            .acquire_lease(id, "w2", later + chrono::TimeDelta::try_seconds(30).unwrap(), later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dequeue_respects_correlation_and_ttl() {
        let store = MemoryInstanceStore::new();
        let now = Utc::now();

        let expired = QueuedEvent {
            id: Uuid::now_v7(),
            name: "qualify".into(),
            correlation_key: None,
            payload: json!({"stale": true}),
            published_at: now - chrono::TimeDelta::try_hours(2).unwrap(),
            expires_at: now - chrono::TimeDelta::try_hours(1).unwrap(),
        };
        let fresh = QueuedEvent {
            id: Uuid::now_v7(),
            name: "qualify".into(),
            correlation_key: Some("deal-1".into()),
            payload: json!({"qualified": true}),
            published_at: now,
            expires_at: now + chrono::TimeDelta::try_hours(1).unwrap(),
        };
        store.enqueue_event(&expired, 100).await.unwrap();
        store.enqueue_event(&fresh, 100).await.unwrap();

        // Keyed dequeue skips the expired unkeyed entry
        let got = store
            .dequeue_event("qualify", Some("deal-1"), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, fresh.id);

        // Nothing deliverable remains
        assert!(store.dequeue_event("qualify", None, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_instances() {
        let store = MemoryInstanceStore::new();
        let old_id = Uuid::now_v7();
        let live_id = Uuid::now_v7();

        let mut old = record(old_id);
        old.status = crate::instance::InstanceStatus::Completed;
        old.last_activity_at = Utc::now() - chrono::TimeDelta::try_days(60).unwrap();
        store.create_instance(&old, None).await.unwrap();
        store.create_instance(&record(live_id), None).await.unwrap();

        let cutoff = Utc::now() - chrono::TimeDelta::try_days(30).unwrap();
        let purged = store.purge_instances(cutoff).await.unwrap();

        assert_eq!(purged, 1);
        assert!(store.get_instance(old_id).await.is_err());
        assert!(store.get_instance(live_id).await.is_ok());
    }
}
