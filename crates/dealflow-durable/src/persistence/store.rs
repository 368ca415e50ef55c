//! InstanceStore trait definition
//!
//! The engine's only view of durable state. Implementations must be
//! thread-safe; the per-instance transactional guarantees are:
//!
//! - appending log entries and updating the materialised record for one
//!   instance is atomic;
//! - matching a published event to a pending wait, completing the wait's
//!   step record, and appending the `EventArrived` entry is a single
//!   transaction (this is what makes event delivery exactly-once);
//! - marks on the materialised record are sticky: a record update carried
//!   by `append` never clears an existing `cancel_requested`, and never
//!   clears an existing `pending_failure` unless the update is terminal.
//!
//! Entries for different instances are independent; no cross-instance
//! ordering is promised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use async_trait::async_trait;

use crate::error::{ErrorKind, StepFailure};
use crate::instance::{
    DeadLetterEntry, InstanceRecord, Lease, LogEntry, LogEntryKind, PendingTimer, PendingWait,
    QueuedEvent, ResourceUsage, Snapshot, SnapshotInfo, StepKey, StepRecord,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Instance already exists
    #[error("instance already exists: {0}")]
    DuplicateInstance(Uuid),

    /// An idempotency key was already used for another instance
    #[error("idempotency key {key:?} already maps to instance {existing}")]
    IdempotencyConflict { key: String, existing: Uuid },

    /// Snapshot not found
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How an event published without a matching wait was absorbed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Held in the per-name queue for late subscribers
    Queued,

    /// The queue was full; the oldest entry was spilled to the event
    /// dead-letter list to make room
    SpilledOldest,
}

/// Resolution of a pending wait
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// A matching event arrived; its payload settles the step record
    Delivered(serde_json::Value),

    /// The wait failed (deadline elapsed or an operator injected a
    /// failure); the step record settles with this failure
    Failed(StepFailure),
}

/// Filter for listing dead-letter entries
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub instance_id: Option<Uuid>,
    pub reason: Option<String>,
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// A queued event that overflowed its per-name bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpilledEvent {
    pub id: Uuid,
    pub event: QueuedEvent,
    pub spilled_at: DateTime<Utc>,
}

/// Durable state behind the engine
///
/// Two implementations ship with the crate:
/// [`MemoryInstanceStore`](super::MemoryInstanceStore) for tests and
/// single-node use, and
/// [`PostgresInstanceStore`](super::PostgresInstanceStore) for
/// production.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    // =========================================================================
    // Instances
    // =========================================================================

    /// Create a new instance; `idempotency_key` deduplicates creations
    async fn create_instance(
        &self,
        record: &InstanceRecord,
        idempotency_key: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Fetch the materialised record
    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StoreError>;

    /// All instances in an active status
    async fn list_active(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Active instances with no log activity since `cutoff`
    async fn list_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Resolve a creation idempotency key to the instance it created
    async fn lookup_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, StoreError>;

    // =========================================================================
    // Log + materialised state
    // =========================================================================

    /// Append entries and update the materialised record atomically
    ///
    /// Entries may be empty (record-only touch). Returns the stamped
    /// entries. The stored record's `cancel_requested` is preserved if the
    /// update would clear it.
    async fn append(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
        entries: Vec<LogEntryKind>,
        update: &InstanceRecord,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Read a page of the log
    async fn read_log(
        &self,
        instance_id: Uuid,
        from_ordinal: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Current log length (next ordinal)
    async fn log_head(&self, instance_id: Uuid) -> Result<u64, StoreError>;

    /// Atomically set the cancellation mark and append the
    /// `CancelRequested` entry; returns false when already terminal
    async fn request_cancel(
        &self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Step records
    // =========================================================================

    async fn get_step(
        &self,
        instance_id: Uuid,
        key: &StepKey,
    ) -> Result<Option<StepRecord>, StoreError>;

    /// Insert or replace a step record
    async fn put_step(&self, record: &StepRecord) -> Result<(), StoreError>;

    async fn list_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    /// Clear errors of the given kinds from an instance's step records so
    /// a dead-letter retry can re-run them; returns the number reset
    async fn reset_step_errors(
        &self,
        instance_id: Uuid,
        kinds: &[ErrorKind],
    ) -> Result<u32, StoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    async fn put_timer(&self, timer: &PendingTimer) -> Result<(), StoreError>;

    /// Remove a timer; `None` means it already fired or was cancelled,
    /// which is how duplicate wake-ups are deduplicated
    async fn remove_timer(&self, timer_id: Uuid) -> Result<Option<PendingTimer>, StoreError>;

    async fn list_timers(&self, instance_id: Uuid) -> Result<Vec<PendingTimer>, StoreError>;

    /// Timers whose fire-at has passed, oldest first
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTimer>, StoreError>;

    // =========================================================================
    // Waits
    // =========================================================================

    async fn put_wait(&self, wait: &PendingWait) -> Result<(), StoreError>;

    async fn list_waits(&self, instance_id: Uuid) -> Result<Vec<PendingWait>, StoreError>;

    /// Earliest-registered wait matching the event, optionally scoped to
    /// one instance
    async fn find_wait(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        instance_id: Option<Uuid>,
    ) -> Result<Option<PendingWait>, StoreError>;

    /// Resolve a wait: remove it, settle its step record, and (for
    /// deliveries) append the `EventArrived` / `ReviewResponded` entries —
    /// all in one transaction. `None` means the wait was already resolved.
    async fn complete_wait(
        &self,
        wait_id: Uuid,
        outcome: &WaitOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<PendingWait>, StoreError>;

    /// Drop all pending waits and timers of an instance (terminal cleanup)
    async fn clear_pending(&self, instance_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Queued events
    // =========================================================================

    /// Hold an event for late subscribers, bounded per name
    async fn enqueue_event(
        &self,
        event: &QueuedEvent,
        max_per_name: usize,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Pop the oldest non-expired queued event matching name and key
    async fn dequeue_event(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedEvent>, StoreError>;

    /// Drop queued events past their TTL; returns the number removed
    async fn expire_events(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Spilled (overflowed) events, newest first
    async fn list_spilled_events(&self, limit: usize) -> Result<Vec<SpilledEvent>, StoreError>;

    /// Record a publisher idempotency key; false when already seen
    async fn record_publisher_key(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Leases
    // =========================================================================

    /// Acquire the exclusive execution lease; succeeds when free, expired,
    /// or already held by this worker
    async fn acquire_lease(
        &self,
        instance_id: Uuid,
        worker: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release the lease if held by this worker
    async fn release_lease(&self, instance_id: Uuid, worker: &str) -> Result<(), StoreError>;

    async fn get_lease(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError>;

    // =========================================================================
    // Dead letters
    // =========================================================================

    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    async fn list_dead_letter(
        &self,
        filter: &DlqFilter,
        page: &Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Remove and return an entry for retry
    async fn take_dead_letter(&self, entry_id: Uuid)
        -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Drop entries dead-lettered before `cutoff`; returns count removed
    async fn purge_dead_letter(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    async fn list_snapshots(&self, instance_id: Uuid) -> Result<Vec<SnapshotInfo>, StoreError>;

    async fn purge_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Materialise a forked instance from snapshot contents
    async fn import_instance(
        &self,
        record: &InstanceRecord,
        log: Vec<LogEntry>,
        steps: Vec<StepRecord>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Retention + usage
    // =========================================================================

    /// Purge terminal instances whose last activity predates `cutoff`,
    /// cascading their log, steps, timers and waits; returns count purged
    async fn purge_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Accumulate resource counters for an instance
    async fn add_usage(&self, instance_id: Uuid, delta: &ResourceUsage)
        -> Result<(), StoreError>;

    async fn get_usage(&self, instance_id: Uuid) -> Result<ResourceUsage, StoreError>;
}
