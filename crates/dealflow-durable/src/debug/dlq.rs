//! Dead-letter operations
//!
//! A failed instance is parked in the DLQ only by an explicit operator
//! action; retrying resets the exhausted step records and puts the
//! instance back on the run-queue.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{DebugError, DebugSurface};
use crate::error::ErrorKind;
use crate::instance::{DeadLetterEntry, InstanceStatus};
use crate::persistence::{DlqFilter, Pagination};

/// Error kinds a retry clears by default
pub const DEFAULT_RETRY_RESET: &[ErrorKind] = &[
    ErrorKind::StepExhausted,
    ErrorKind::Transient,
    ErrorKind::Timeout,
];

/// Aggregate view of the queue
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total: u64,
    pub by_reason: HashMap<String, u64>,
    pub by_last_state: HashMap<String, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl DebugSurface {
    /// Park a failed instance in the dead-letter queue
    pub async fn dead_letter(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<DeadLetterEntry, DebugError> {
        let mut record = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|_| DebugError::InstanceNotFound(instance_id))?;

        if record.status != InstanceStatus::Failed {
            return Err(DebugError::NotFailed(instance_id));
        }

        let now = self.clock.now();
        let entry = DeadLetterEntry {
            id: Uuid::now_v7(),
            instance_id,
            failed_at: now,
            reason: reason.to_string(),
            last_state: record.state.clone(),
            retry_count: 0,
            payload: serde_json::json!({
                "failure": record.failure,
                "input": record.input,
            }),
        };

        record.status = InstanceStatus::DeadLettered;
        self.store.append(instance_id, now, vec![], &record).await?;
        self.store.push_dead_letter(&entry).await?;

        info!(%instance_id, reason, "instance moved to dead-letter queue");
        Ok(entry)
    }

    /// Remove an entry and make its instance runnable again
    ///
    /// Step records whose error kind is in `reset_kinds` (default: the
    /// retryable kinds plus `StepExhausted`) lose their error and attempt
    /// count, so the step body gets a fresh budget. Returns the instance
    /// id for re-queueing. This is the one sanctioned way progress
    /// entries reappear after a terminal entry.
    pub async fn retry_dead_letter(
        &self,
        entry_id: Uuid,
        reset_kinds: Option<&[ErrorKind]>,
    ) -> Result<Uuid, DebugError> {
        let entry = self
            .store
            .take_dead_letter(entry_id)
            .await?
            .ok_or(DebugError::EntryNotFound(entry_id))?;

        let mut record = self
            .store
            .get_instance(entry.instance_id)
            .await
            .map_err(|_| DebugError::InstanceNotFound(entry.instance_id))?;

        let reset = self
            .store
            .reset_step_errors(
                entry.instance_id,
                reset_kinds.unwrap_or(DEFAULT_RETRY_RESET),
            )
            .await?;

        record.status = InstanceStatus::Running;
        record.failure = None;
        record.pending_failure = None;
        self.store
            .append(entry.instance_id, self.clock.now(), vec![], &record)
            .await?;

        info!(
            instance_id = %entry.instance_id,
            steps_reset = reset,
            "dead-letter entry re-queued"
        );
        Ok(entry.instance_id)
    }

    pub async fn list_dead_letter(
        &self,
        filter: &DlqFilter,
        page: &Pagination,
    ) -> Result<Vec<DeadLetterEntry>, DebugError> {
        Ok(self.store.list_dead_letter(filter, page).await?)
    }

    /// Drop entries older than the given age; returns the count removed
    pub async fn purge_dead_letter(&self, older_than: std::time::Duration) -> Result<u64, DebugError> {
        let cutoff = self.clock.now()
            - TimeDelta::from_std(older_than).unwrap_or_else(|_| TimeDelta::MAX);
        Ok(self.store.purge_dead_letter(cutoff).await?)
    }

    /// Counts by reason and last state, with age extremes
    pub async fn dlq_stats(&self) -> Result<DlqStats, DebugError> {
        let entries = self
            .store
            .list_dead_letter(&DlqFilter::default(), &Pagination {
                offset: 0,
                limit: u32::MAX,
            })
            .await?;

        let mut by_reason: HashMap<String, u64> = HashMap::new();
        let mut by_last_state: HashMap<String, u64> = HashMap::new();
        for entry in &entries {
            *by_reason.entry(entry.reason.clone()).or_default() += 1;
            *by_last_state.entry(entry.last_state.clone()).or_default() += 1;
        }

        Ok(DlqStats {
            total: entries.len() as u64,
            by_reason,
            by_last_state,
            oldest: entries.iter().map(|e| e.failed_at).min(),
            newest: entries.iter().map(|e| e.failed_at).max(),
        })
    }
}
