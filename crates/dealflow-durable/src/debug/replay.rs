//! Log replay and time travel
//!
//! The append-only log is the source of truth: folding it from ordinal 0
//! reconstructs the materialised state exactly. `state_at` folds a time
//! prefix, `replay` walks entries through a caller-supplied observer at a
//! speed-scaled rate without mutating anything.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{DebugError, DebugSurface};
use crate::error::StepFailure;
use crate::instance::{InstanceStatus, LogEntry, LogEntryKind};

/// Materialised state reconstructed purely from the log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedState {
    pub state: String,
    pub status: InstanceStatus,
    pub output: Option<serde_json::Value>,
    pub failure: Option<StepFailure>,
    /// State-visit sequence implied by the transitions seen
    pub visit: u32,
    pub entries_applied: u64,
}

/// Fold a log prefix into its materialised projection
pub fn fold(entries: &[LogEntry]) -> ReplayedState {
    let mut state = String::new();
    let mut status = InstanceStatus::Running;
    let mut output = None;
    let mut failure = None;
    let mut transitions: u32 = 0;

    for entry in entries {
        match &entry.kind {
            LogEntryKind::StateTransition { to, .. } => {
                state = to.clone();
                transitions += 1;
            }
            LogEntryKind::Terminal {
                status: terminal_status,
                output: terminal_output,
                failure: terminal_failure,
            } => {
                status = *terminal_status;
                output = terminal_output.clone();
                failure = terminal_failure.clone();
            }
            _ => {}
        }
    }

    ReplayedState {
        state,
        status,
        output,
        failure,
        // The creation transition does not count as a visit
        visit: transitions.saturating_sub(1),
        entries_applied: entries.len() as u64,
    }
}

/// Options for observed replay
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Playback speed multiplier; `0.0` replays as fast as possible
    pub speed: f64,
    /// First ordinal to emit
    pub from: u64,
    /// Last ordinal to emit (inclusive); `None` runs to the head
    pub to: Option<u64>,
    /// Entry-kind names to emit; `None` emits everything
    pub filter: Option<Vec<String>>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: 0.0,
            from: 0,
            to: None,
            filter: None,
        }
    }
}

impl DebugSurface {
    /// Reconstruct the materialised state as of `at`
    ///
    /// Replays the log up to the last entry with a timestamp ≤ the
    /// target; entries after it are ignored.
    pub async fn state_at(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ReplayedState, DebugError> {
        let log = self.full_log(instance_id).await?;
        let prefix: Vec<LogEntry> = log.into_iter().take_while(|e| e.at <= at).collect();
        Ok(fold(&prefix))
    }

    /// Reconstruct the current materialised state from the full log
    pub async fn replayed_state(&self, instance_id: Uuid) -> Result<ReplayedState, DebugError> {
        let log = self.full_log(instance_id).await?;
        Ok(fold(&log))
    }

    /// Walk historical entries through `observer`
    ///
    /// Pure observation: nothing is mutated. With a positive `speed` the
    /// walk sleeps the (scaled) gap between entry timestamps; gaps are
    /// capped at 30 seconds so replaying a month-long instance stays
    /// usable.
    pub async fn replay<F>(
        &self,
        instance_id: Uuid,
        options: ReplayOptions,
        mut observer: F,
    ) -> Result<u64, DebugError>
    where
        F: FnMut(&LogEntry),
    {
        let log = self.full_log(instance_id).await?;

        let mut emitted = 0;
        let mut previous_at: Option<DateTime<Utc>> = None;

        for entry in &log {
            if entry.ordinal < options.from {
                continue;
            }
            if let Some(to) = options.to {
                if entry.ordinal > to {
                    break;
                }
            }
            if let Some(filter) = &options.filter {
                if !filter.iter().any(|name| name == entry.kind.name()) {
                    continue;
                }
            }

            if options.speed > 0.0 {
                if let Some(previous) = previous_at {
                    let gap_ms = (entry.at - previous).num_milliseconds().max(0) as f64;
                    let scaled = (gap_ms / options.speed).min(30_000.0);
                    if scaled >= 1.0 {
                        tokio::time::sleep(std::time::Duration::from_millis(scaled as u64)).await;
                    }
                }
            }
            previous_at = Some(entry.at);

            observer(entry);
            emitted += 1;
        }
        Ok(emitted)
    }
}
