//! Stuck-instance detection and recovery
//!
//! An active instance with no log activity past the configured threshold
//! is "stuck". Recovery actions mutate only through the store; the engine
//! re-queues the instance afterwards.

use chrono::TimeDelta;
use tracing::info;
use uuid::Uuid;

use super::{DebugError, DebugSurface};
use crate::error::StepFailure;
use crate::instance::{InstanceRecord, TimerPurpose};
use crate::persistence::WaitOutcome;

impl DebugSurface {
    /// Active instances whose last activity predates the stuck threshold
    pub async fn list_stuck(&self) -> Result<Vec<InstanceRecord>, DebugError> {
        let cutoff = self.clock.now()
            - TimeDelta::from_std(self.config.stuck_threshold).unwrap_or_else(|_| TimeDelta::MAX);
        Ok(self.store.list_stuck(cutoff).await?)
    }

    /// Inject a synthetic timeout into every pending wait of the instance
    ///
    /// The waits settle with a `Timeout` failure exactly as if their
    /// deadlines had elapsed; handlers observe it on the next resume.
    /// Returns the number of waits resolved.
    pub async fn force_timeout(&self, instance_id: Uuid) -> Result<u32, DebugError> {
        let waits = self.store.list_waits(instance_id).await?;
        let now = self.clock.now();

        let mut resolved = 0;
        for wait in waits {
            let outcome = WaitOutcome::Failed(StepFailure::timeout(format!(
                "operator forced timeout while waiting for {:?}",
                wait.event_name
            )));
            if self
                .store
                .complete_wait(wait.id, &outcome, now)
                .await?
                .is_some()
            {
                resolved += 1;
            }
        }

        // Their deadline timers have nothing left to do
        for timer in self.store.list_timers(instance_id).await? {
            if matches!(timer.purpose, TimerPurpose::WaitDeadline { .. }) {
                self.store.remove_timer(timer.id).await?;
            }
        }

        info!(%instance_id, resolved, "forced timeout injected into pending waits");
        Ok(resolved)
    }

    /// Resolve pending approval waits affirmatively
    ///
    /// Only permitted when the engine is configured with
    /// `allow_auto_approve`; refused otherwise.
    pub async fn auto_approve(&self, instance_id: Uuid) -> Result<u32, DebugError> {
        if !self.config.allow_auto_approve {
            return Err(DebugError::NotPermitted(
                "auto-approve is disabled; enable allow_auto_approve to use it".to_string(),
            ));
        }

        let waits = self.store.list_waits(instance_id).await?;
        let now = self.clock.now();

        let mut approved = 0;
        for wait in waits {
            if wait.approval.is_none() {
                continue;
            }
            let outcome = WaitOutcome::Delivered(serde_json::json!({
                "approved": true,
                "reviewer": "auto-approve",
                "comment": "approved by operator recovery action",
            }));
            if self
                .store
                .complete_wait(wait.id, &outcome, now)
                .await?
                .is_some()
            {
                approved += 1;
            }
        }

        info!(%instance_id, approved, "auto-approved pending review gates");
        Ok(approved)
    }
}
