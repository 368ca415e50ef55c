//! Debug & inspection surface
//!
//! Read-only views over any instance (no lease required; reads may trail
//! the leaseholder slightly) plus the explicitly-operator-driven recovery
//! actions: dead-letter retry, stuck-instance recovery, snapshot forks.

mod dlq;
mod replay;
mod snapshot;
mod stuck;

pub use dlq::DlqStats;
pub use replay::{ReplayOptions, ReplayedState};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::instance::{
    InstanceRecord, InstanceStatus, Lease, LogEntry, LogEntryKind, PendingTimer, PendingWait,
    ResourceUsage, StepRecord,
};
use crate::persistence::{InstanceStore, StoreError};

/// Errors from debug operations
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    #[error("dead-letter entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("instance {0} is not in a failed status")]
    NotFailed(Uuid),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything `inspect` returns for one instance
#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub record: InstanceRecord,
    pub usage: ResourceUsage,
    pub steps: Vec<StepRecord>,
    pub pending_waits: Vec<PendingWait>,
    pub pending_timers: Vec<PendingTimer>,
    pub lease: Option<Lease>,
    pub log_head: u64,
    /// Tail of the log, newest last
    pub recent_log: Vec<LogEntry>,
    /// Resource-threshold violations, empty when healthy
    pub warnings: Vec<String>,
}

/// One state occupancy on the timeline
#[derive(Debug, Clone, Serialize)]
pub struct StateSpan {
    pub state: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// Structured diff of two instances
#[derive(Debug, Clone, Serialize)]
pub struct InstanceComparison {
    pub same_kind: bool,
    pub state: (String, String),
    pub status: (InstanceStatus, InstanceStatus),
    pub log_len: (u64, u64),
    pub error_entries: (u64, u64),
    pub duration_ms: (u64, u64),
    /// First ordinal at which the two logs carry different entry kinds
    pub first_divergence: Option<u64>,
}

/// The inspection surface
pub struct DebugSurface {
    pub(crate) store: Arc<dyn InstanceStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<EngineConfig>,
}

impl DebugSurface {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Full point-in-time view of one instance
    pub async fn inspect(&self, instance_id: Uuid) -> Result<InspectionReport, DebugError> {
        let record = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|_| DebugError::InstanceNotFound(instance_id))?;

        let usage = self.store.get_usage(instance_id).await?;
        let log_head = self.store.log_head(instance_id).await?;
        let from = log_head.saturating_sub(50);
        let recent_log = self.store.read_log(instance_id, from, 50).await?;
        let warnings = resource_warnings(&usage, &self.config);
        for warning in &warnings {
            warn!(%instance_id, "{warning}");
        }

        Ok(InspectionReport {
            usage,
            steps: self.store.list_steps(instance_id).await?,
            pending_waits: self.store.list_waits(instance_id).await?,
            pending_timers: self.store.list_timers(instance_id).await?,
            lease: self.store.get_lease(instance_id).await?,
            log_head,
            recent_log,
            warnings,
            record,
        })
    }

    /// State occupancy history derived from the log
    pub async fn timeline(&self, instance_id: Uuid) -> Result<Vec<StateSpan>, DebugError> {
        let log = self.full_log(instance_id).await?;

        let mut spans: Vec<StateSpan> = Vec::new();
        for entry in &log {
            match &entry.kind {
                LogEntryKind::StateTransition { to, .. } => {
                    if let Some(last) = spans.last_mut() {
                        last.exited_at = Some(entry.at);
                    }
                    spans.push(StateSpan {
                        state: to.clone(),
                        entered_at: entry.at,
                        exited_at: None,
                    });
                }
                LogEntryKind::Terminal { .. } => {
                    if let Some(last) = spans.last_mut() {
                        last.exited_at = Some(entry.at);
                    }
                }
                _ => {}
            }
        }
        Ok(spans)
    }

    /// Structured diff of two instances' progression
    pub async fn compare(&self, a: Uuid, b: Uuid) -> Result<InstanceComparison, DebugError> {
        let record_a = self
            .store
            .get_instance(a)
            .await
            .map_err(|_| DebugError::InstanceNotFound(a))?;
        let record_b = self
            .store
            .get_instance(b)
            .await
            .map_err(|_| DebugError::InstanceNotFound(b))?;

        let log_a = self.full_log(a).await?;
        let log_b = self.full_log(b).await?;

        let first_divergence = log_a
            .iter()
            .zip(log_b.iter())
            .position(|(x, y)| x.kind.name() != y.kind.name())
            .map(|i| i as u64)
            .or_else(|| {
                (log_a.len() != log_b.len()).then(|| log_a.len().min(log_b.len()) as u64)
            });

        let errors = |log: &[LogEntry]| {
            log.iter()
                .filter(|e| {
                    matches!(
                        e.kind,
                        LogEntryKind::ErrorRaised { .. } | LogEntryKind::StepFailed { .. }
                    )
                })
                .count() as u64
        };
        let duration = |record: &InstanceRecord| {
            (record.last_activity_at - record.created_at).num_milliseconds().max(0) as u64
        };

        Ok(InstanceComparison {
            same_kind: record_a.kind == record_b.kind,
            state: (record_a.state.clone(), record_b.state.clone()),
            status: (record_a.status, record_b.status),
            log_len: (log_a.len() as u64, log_b.len() as u64),
            error_entries: (errors(&log_a), errors(&log_b)),
            duration_ms: (duration(&record_a), duration(&record_b)),
            first_divergence,
        })
    }

    pub(crate) async fn full_log(&self, instance_id: Uuid) -> Result<Vec<LogEntry>, DebugError> {
        Ok(self
            .store
            .read_log(instance_id, 0, usize::MAX)
            .await
            .map_err(|_| DebugError::InstanceNotFound(instance_id))?)
    }
}

/// Threshold checks backing the resource monitor
pub fn resource_warnings(usage: &ResourceUsage, config: &EngineConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if usage.busy_ms > config.warn_busy_threshold.as_millis() as u64 {
        warnings.push(format!(
            "busy time {}ms exceeds threshold {}ms",
            usage.busy_ms,
            config.warn_busy_threshold.as_millis()
        ));
    }
    if usage.external_calls > config.warn_external_calls {
        warnings.push(format!(
            "{} external calls exceed threshold {}",
            usage.external_calls, config.warn_external_calls
        ));
    }
    let store_ops = usage.store_reads + usage.store_writes;
    if store_ops > config.warn_store_ops {
        warnings.push(format!(
            "{store_ops} store operations exceed threshold {}",
            config.warn_store_ops
        ));
    }
    warnings
}
