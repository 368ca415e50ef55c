//! Snapshots and time-travel forks
//!
//! A snapshot captures an instance's materialised record, log prefix and
//! step records under a label. Restoring never mutates the original: it
//! forks a brand-new instance from the captured state, whose log then
//! diverges cleanly.

use tracing::info;
use uuid::Uuid;

use super::{DebugError, DebugSurface};
use crate::instance::{InstanceRecord, Snapshot, SnapshotInfo};

impl DebugSurface {
    /// Persist a labelled point-in-time copy of the instance
    pub async fn take_snapshot(
        &self,
        instance_id: Uuid,
        label: &str,
    ) -> Result<SnapshotInfo, DebugError> {
        let record = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|_| DebugError::InstanceNotFound(instance_id))?;
        let log = self.full_log(instance_id).await?;
        let steps = self.store.list_steps(instance_id).await?;

        let snapshot = Snapshot {
            id: Uuid::now_v7(),
            instance_id,
            label: label.to_string(),
            taken_at: self.clock.now(),
            log_head: log.len() as u64,
            record,
            log,
            steps,
        };
        self.store.put_snapshot(&snapshot).await?;

        info!(%instance_id, snapshot_id = %snapshot.id, label, "snapshot taken");
        Ok(SnapshotInfo::from(&snapshot))
    }

    /// Fork a new instance from a snapshot
    ///
    /// The fork starts with the snapshot's record, log and step records
    /// under a fresh id; the original instance is untouched. Returns the
    /// forked record so the caller can enqueue it when it is active.
    pub async fn restore_snapshot(
        &self,
        snapshot_id: Uuid,
    ) -> Result<InstanceRecord, DebugError> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or(DebugError::SnapshotNotFound(snapshot_id))?;

        let mut record = snapshot.record.clone();
        record.id = Uuid::now_v7();
        record.last_activity_at = self.clock.now();

        self.store
            .import_instance(&record, snapshot.log, snapshot.steps)
            .await?;

        info!(
            original = %snapshot.instance_id,
            fork = %record.id,
            %snapshot_id,
            "instance forked from snapshot"
        );
        Ok(record)
    }

    pub async fn list_snapshots(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<SnapshotInfo>, DebugError> {
        Ok(self.store.list_snapshots(instance_id).await?)
    }
}
