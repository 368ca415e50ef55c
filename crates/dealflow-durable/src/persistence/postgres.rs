//! PostgreSQL implementation of InstanceStore
//!
//! Production persistence:
//! - per-instance log append + record update in one transaction, with a
//!   `FOR UPDATE` ordinal check
//! - wait completion (delete + step settle + arrival entries) in one
//!   transaction, giving exactly-once delivery
//! - `SKIP LOCKED` dequeue of held events
//!
//! Record-shaped values (instance records, step records, waits, timers,
//! snapshots) are stored as JSONB blobs next to the columns queries
//! filter on, so the Rust types remain the single source of shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::error::ErrorKind;
use crate::instance::{
    DeadLetterEntry, InstanceRecord, Lease, LogEntry, LogEntryKind, PendingTimer, PendingWait,
    QueuedEvent, ResourceUsage, Snapshot, SnapshotInfo, StepKey, StepRecord,
};

/// PostgreSQL-backed store
///
/// # Example
///
/// ```ignore
/// use dealflow_durable::PostgresInstanceStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect(&database_url).await?;
/// let store = PostgresInstanceStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {e}");
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(ser_err)
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(ser_err)
}

impl PostgresInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the engine's tables when they do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        const SCHEMA: &[&str] = &[
            r#"CREATE TABLE IF NOT EXISTS df_instances (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_activity_at TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS df_instances_status_idx
                ON df_instances (status, last_activity_at)"#,
            r#"CREATE TABLE IF NOT EXISTS df_log (
                instance_id UUID NOT NULL,
                ordinal BIGINT NOT NULL,
                kind TEXT NOT NULL,
                entry JSONB NOT NULL,
                at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, ordinal)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_steps (
                instance_id UUID NOT NULL,
                step_name TEXT NOT NULL,
                ordinal BIGINT NOT NULL,
                record JSONB NOT NULL,
                PRIMARY KEY (instance_id, step_name, ordinal)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_timers (
                id UUID PRIMARY KEY,
                instance_id UUID NOT NULL,
                fire_at TIMESTAMPTZ NOT NULL,
                timer JSONB NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS df_timers_fire_at_idx ON df_timers (fire_at)"#,
            r#"CREATE TABLE IF NOT EXISTS df_waits (
                id UUID PRIMARY KEY,
                instance_id UUID NOT NULL,
                event_name TEXT NOT NULL,
                correlation_key TEXT,
                registered_at TIMESTAMPTZ NOT NULL,
                wait JSONB NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS df_waits_event_idx
                ON df_waits (event_name, correlation_key)"#,
            r#"CREATE TABLE IF NOT EXISTS df_queued_events (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                correlation_key TEXT,
                published_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                event JSONB NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS df_queued_events_name_idx
                ON df_queued_events (name, published_at)"#,
            r#"CREATE TABLE IF NOT EXISTS df_spilled_events (
                id UUID PRIMARY KEY,
                spilled_at TIMESTAMPTZ NOT NULL,
                event JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_publisher_keys (
                key TEXT PRIMARY KEY,
                seen_at TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_idempotency_keys (
                key TEXT PRIMARY KEY,
                instance_id UUID NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_leases (
                instance_id UUID PRIMARY KEY,
                worker TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_dlq (
                id UUID PRIMARY KEY,
                instance_id UUID NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL,
                reason TEXT NOT NULL,
                entry JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_snapshots (
                id UUID PRIMARY KEY,
                instance_id UUID NOT NULL,
                taken_at TIMESTAMPTZ NOT NULL,
                snapshot JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS df_usage (
                instance_id UUID PRIMARY KEY,
                steps_executed BIGINT NOT NULL DEFAULT 0,
                retries BIGINT NOT NULL DEFAULT 0,
                events_consumed BIGINT NOT NULL DEFAULT 0,
                external_calls BIGINT NOT NULL DEFAULT 0,
                store_reads BIGINT NOT NULL DEFAULT 0,
                store_writes BIGINT NOT NULL DEFAULT 0,
                busy_ms BIGINT NOT NULL DEFAULT 0
            )"#,
        ];

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    fn record_from_row(row: sqlx::postgres::PgRow) -> Result<InstanceRecord, StoreError> {
        from_json(row.get::<serde_json::Value, _>("record"))
    }

    /// Insert log entries inside an open transaction, returning them
    /// stamped with ordinals
    async fn append_entries_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        instance_id: Uuid,
        at: DateTime<Utc>,
        entries: Vec<LogEntryKind>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        // Serialise appends per instance by locking its row
        sqlx::query(r#"SELECT id FROM df_instances WHERE id = $1 FOR UPDATE"#)
            .bind(instance_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(ordinal) + 1, 0) AS next_ordinal
            FROM df_log WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        let mut next: i64 = row.get("next_ordinal");

        let mut stamped = Vec::with_capacity(entries.len());
        for kind in entries {
            let entry = LogEntry {
                ordinal: next as u64,
                at,
                kind,
            };
            sqlx::query(
                r#"
                INSERT INTO df_log (instance_id, ordinal, kind, entry, at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(instance_id)
            .bind(next)
            .bind(entry.kind.name())
            .bind(to_json(&entry)?)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

            next += 1;
            stamped.push(entry);
        }
        Ok(stamped)
    }

    /// Write the instance row inside an open transaction, preserving an
    /// existing cancellation mark
    async fn put_record_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        update: &InstanceRecord,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = sqlx::query(r#"SELECT record FROM df_instances WHERE id = $1 FOR UPDATE"#)
            .bind(update.id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::InstanceNotFound(update.id))?;
        let stored: InstanceRecord = from_json(row.get::<serde_json::Value, _>("record"))?;

        let mut next = update.clone();
        if next.cancel_requested.is_none() {
            next.cancel_requested = stored.cancel_requested;
        }
        if next.pending_failure.is_none() && !next.status.is_terminal() {
            next.pending_failure = stored.pending_failure;
        }
        next.last_activity_at = at;

        sqlx::query(
            r#"
            UPDATE df_instances
            SET kind = $2, version = $3, status = $4, state = $5,
                record = $6, last_activity_at = $7
            WHERE id = $1
            "#,
        )
        .bind(next.id)
        .bind(&next.kind)
        .bind(&next.version)
        .bind(next.status.to_string())
        .bind(&next.state)
        .bind(to_json(&next)?)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn put_step_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &StepRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO df_steps (instance_id, step_name, ordinal, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instance_id, step_name, ordinal)
            DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(record.instance_id)
        .bind(&record.key.name)
        .bind(record.key.ordinal as i64)
        .bind(to_json(record)?)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    #[instrument(skip(self, record, idempotency_key), fields(instance_id = %record.id))]
    async fn create_instance(
        &self,
        record: &InstanceRecord,
        idempotency_key: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(key) = idempotency_key {
            let existing = sqlx::query(
                r#"SELECT instance_id FROM df_idempotency_keys WHERE key = $1"#,
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if let Some(row) = existing {
                return Err(StoreError::IdempotencyConflict {
                    key: key.to_string(),
                    existing: row.get("instance_id"),
                });
            }
            sqlx::query(r#"INSERT INTO df_idempotency_keys (key, instance_id) VALUES ($1, $2)"#)
                .bind(key)
                .bind(record.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO df_instances
                (id, kind, version, status, state, record, created_at, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.kind)
        .bind(&record.version)
        .bind(record.status.to_string())
        .bind(&record.state)
        .bind(to_json(record)?)
        .bind(record.created_at)
        .bind(record.last_activity_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateInstance(record.id));
        }

        tx.commit().await.map_err(db_err)?;
        debug!("instance row created");
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StoreError> {
        let row = sqlx::query(r#"SELECT record FROM df_instances WHERE id = $1"#)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        Self::record_from_row(row)
    }

    async fn list_active(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT record FROM df_instances WHERE status IN ('running', 'suspended')"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Self::record_from_row(row)?);
        }
        Ok(records)
    }

    async fn list_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM df_instances
            WHERE status IN ('running', 'suspended') AND last_activity_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Self::record_from_row(row)?);
        }
        Ok(records)
    }

    async fn lookup_idempotency_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(r#"SELECT instance_id FROM df_idempotency_keys WHERE key = $1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("instance_id")))
    }

    #[instrument(skip(self, entries, update))]
    async fn append(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
        entries: Vec<LogEntryKind>,
        update: &InstanceRecord,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let stamped = Self::append_entries_tx(&mut tx, instance_id, at, entries).await?;
        Self::put_record_tx(&mut tx, update, at).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(stamped)
    }

    async fn read_log(
        &self,
        instance_id: Uuid,
        from_ordinal: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry FROM df_log
            WHERE instance_id = $1 AND ordinal >= $2
            ORDER BY ordinal
            LIMIT $3
            "#,
        )
        .bind(instance_id)
        .bind(from_ordinal as i64)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(from_json(row.get::<serde_json::Value, _>("entry"))?);
        }
        Ok(entries)
    }

    async fn log_head(&self, instance_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"SELECT COALESCE(MAX(ordinal) + 1, 0) AS head FROM df_log WHERE instance_id = $1"#,
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get::<i64, _>("head") as u64)
    }

    #[instrument(skip(self))]
    async fn request_cancel(
        &self,
        instance_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(r#"SELECT record FROM df_instances WHERE id = $1 FOR UPDATE"#)
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        let mut record: InstanceRecord = from_json(row.get::<serde_json::Value, _>("record"))?;

        if record.status.is_terminal() {
            return Ok(false);
        }
        if record.cancel_requested.is_none() {
            record.cancel_requested = Some(reason.to_string());
            Self::append_entries_tx(
                &mut tx,
                instance_id,
                at,
                vec![LogEntryKind::CancelRequested {
                    reason: reason.to_string(),
                }],
            )
            .await?;

            record.last_activity_at = at;
            sqlx::query(
                r#"UPDATE df_instances SET record = $2, last_activity_at = $3 WHERE id = $1"#,
            )
            .bind(instance_id)
            .bind(to_json(&record)?)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn get_step(
        &self,
        instance_id: Uuid,
        key: &StepKey,
    ) -> Result<Option<StepRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT record FROM df_steps
            WHERE instance_id = $1 AND step_name = $2 AND ordinal = $3
            "#,
        )
        .bind(instance_id)
        .bind(&key.name)
        .bind(key.ordinal as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| from_json(r.get::<serde_json::Value, _>("record")))
            .transpose()
    }

    async fn put_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::put_step_tx(&mut tx, record).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn list_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT record FROM df_steps WHERE instance_id = $1 ORDER BY ordinal, step_name"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            steps.push(from_json(row.get::<serde_json::Value, _>("record"))?);
        }
        Ok(steps)
    }

    async fn reset_step_errors(
        &self,
        instance_id: Uuid,
        kinds: &[ErrorKind],
    ) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            r#"
            SELECT record FROM df_steps
            WHERE instance_id = $1 AND record->'error' IS NOT NULL
              AND record->>'error' IS NOT NULL
            FOR UPDATE
            "#,
        )
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut reset = 0;
        for row in rows {
            let mut step: StepRecord = from_json(row.get::<serde_json::Value, _>("record"))?;
            let Some(error) = &step.error else { continue };
            if !kinds.contains(&error.kind) {
                continue;
            }
            step.error = None;
            step.attempts = 0;
            step.retry_pending = false;
            step.ended_at = None;
            Self::put_step_tx(&mut tx, &step).await?;
            reset += 1;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(reset)
    }

    async fn put_timer(&self, timer: &PendingTimer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO df_timers (id, instance_id, fire_at, timer)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET fire_at = EXCLUDED.fire_at, timer = EXCLUDED.timer
            "#,
        )
        .bind(timer.id)
        .bind(timer.instance_id)
        .bind(timer.fire_at)
        .bind(to_json(timer)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_timer(&self, timer_id: Uuid) -> Result<Option<PendingTimer>, StoreError> {
        let row = sqlx::query(r#"DELETE FROM df_timers WHERE id = $1 RETURNING timer"#)
            .bind(timer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_json(r.get::<serde_json::Value, _>("timer")))
            .transpose()
    }

    async fn list_timers(&self, instance_id: Uuid) -> Result<Vec<PendingTimer>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT timer FROM df_timers WHERE instance_id = $1 ORDER BY fire_at"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut timers = Vec::with_capacity(rows.len());
        for row in rows {
            timers.push(from_json(row.get::<serde_json::Value, _>("timer"))?);
        }
        Ok(timers)
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTimer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT timer FROM df_timers
            WHERE fire_at <= $1
            ORDER BY fire_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut timers = Vec::with_capacity(rows.len());
        for row in rows {
            timers.push(from_json(row.get::<serde_json::Value, _>("timer"))?);
        }
        Ok(timers)
    }

    async fn put_wait(&self, wait: &PendingWait) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO df_waits
                (id, instance_id, event_name, correlation_key, registered_at, wait)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(wait.id)
        .bind(wait.instance_id)
        .bind(&wait.event_name)
        .bind(&wait.correlation_key)
        .bind(wait.registered_at)
        .bind(to_json(wait)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_waits(&self, instance_id: Uuid) -> Result<Vec<PendingWait>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT wait FROM df_waits WHERE instance_id = $1 ORDER BY registered_at"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut waits = Vec::with_capacity(rows.len());
        for row in rows {
            waits.push(from_json(row.get::<serde_json::Value, _>("wait"))?);
        }
        Ok(waits)
    }

    async fn find_wait(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        instance_id: Option<Uuid>,
    ) -> Result<Option<PendingWait>, StoreError> {
        // An unkeyed wait accepts any event of the name; a keyed wait
        // only the matching key
        let row = sqlx::query(
            r#"
            SELECT wait FROM df_waits
            WHERE event_name = $1
              AND (correlation_key IS NULL OR correlation_key = $2)
              AND ($3::uuid IS NULL OR instance_id = $3)
            ORDER BY registered_at
            LIMIT 1
            "#,
        )
        .bind(event_name)
        .bind(correlation_key)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| from_json(r.get::<serde_json::Value, _>("wait")))
            .transpose()
    }

    #[instrument(skip(self, outcome))]
    async fn complete_wait(
        &self,
        wait_id: Uuid,
        outcome: &WaitOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<PendingWait>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(r#"DELETE FROM df_waits WHERE id = $1 RETURNING wait"#)
            .bind(wait_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let wait: PendingWait = from_json(row.get::<serde_json::Value, _>("wait"))?;

        let existing = sqlx::query(
            r#"
            SELECT record FROM df_steps
            WHERE instance_id = $1 AND step_name = $2 AND ordinal = $3
            FOR UPDATE
            "#,
        )
        .bind(wait.instance_id)
        .bind(&wait.step.name)
        .bind(wait.step.ordinal as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut step = match existing {
            Some(row) => from_json(row.get::<serde_json::Value, _>("record"))?,
            None => StepRecord::open(wait.instance_id, wait.step.clone(), at),
        };

        match outcome {
            WaitOutcome::Delivered(payload) => {
                step.settle_ok(payload.clone(), at);
                Self::put_step_tx(&mut tx, &step).await?;

                let mut entries = vec![LogEntryKind::EventArrived {
                    wait_id: wait.id,
                    event: wait.event_name.clone(),
                    correlation_key: wait.correlation_key.clone(),
                    payload: payload.clone(),
                }];
                if wait.approval.is_some() {
                    entries.push(LogEntryKind::ReviewResponded {
                        step: wait.step.clone(),
                        approved: payload
                            .get("approved")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                        payload: payload.clone(),
                    });
                }
                Self::append_entries_tx(&mut tx, wait.instance_id, at, entries).await?;

                sqlx::query(
                    r#"
                    INSERT INTO df_usage (instance_id, events_consumed)
                    VALUES ($1, 1)
                    ON CONFLICT (instance_id)
                    DO UPDATE SET events_consumed = df_usage.events_consumed + 1
                    "#,
                )
                .bind(wait.instance_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            WaitOutcome::Failed(failure) => {
                step.settle_err(failure.clone(), at);
                Self::put_step_tx(&mut tx, &step).await?;
            }
        }

        sqlx::query(r#"UPDATE df_instances SET last_activity_at = $2 WHERE id = $1"#)
            .bind(wait.instance_id)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(wait))
    }

    async fn clear_pending(&self, instance_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM df_waits WHERE instance_id = $1"#)
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(r#"DELETE FROM df_timers WHERE instance_id = $1"#)
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn enqueue_event(
        &self,
        event: &QueuedEvent,
        max_per_name: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO df_queued_events
                (id, name, correlation_key, published_at, expires_at, event)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.name)
        .bind(&event.correlation_key)
        .bind(event.published_at)
        .bind(event.expires_at)
        .bind(to_json(event)?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(r#"SELECT COUNT(*) AS n FROM df_queued_events WHERE name = $1"#)
            .bind(&event.name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let count: i64 = row.get("n");

        let outcome = if count > max_per_name as i64 {
            let spilled = sqlx::query(
                r#"
                DELETE FROM df_queued_events
                WHERE id = (
                    SELECT id FROM df_queued_events
                    WHERE name = $1
                    ORDER BY published_at
                    LIMIT 1
                )
                RETURNING event
                "#,
            )
            .bind(&event.name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query(
                r#"INSERT INTO df_spilled_events (id, spilled_at, event) VALUES ($1, $2, $3)"#,
            )
            .bind(Uuid::now_v7())
            .bind(event.published_at)
            .bind(spilled.get::<serde_json::Value, _>("event"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            EnqueueOutcome::SpilledOldest
        } else {
            EnqueueOutcome::Queued
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    async fn dequeue_event(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM df_queued_events
            WHERE id = (
                SELECT id FROM df_queued_events
                WHERE name = $1
                  AND ($2::text IS NULL OR correlation_key = $2)
                  AND expires_at > $3
                ORDER BY published_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING event
            "#,
        )
        .bind(event_name)
        .bind(correlation_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| from_json(r.get::<serde_json::Value, _>("event")))
            .transpose()
    }

    async fn expire_events(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(r#"DELETE FROM df_queued_events WHERE expires_at <= $1"#)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn list_spilled_events(&self, limit: usize) -> Result<Vec<SpilledEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, spilled_at, event FROM df_spilled_events
            ORDER BY spilled_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut spilled = Vec::with_capacity(rows.len());
        for row in rows {
            spilled.push(SpilledEvent {
                id: row.get("id"),
                event: from_json(row.get::<serde_json::Value, _>("event"))?,
                spilled_at: row.get("spilled_at"),
            });
        }
        Ok(spilled)
    }

    async fn record_publisher_key(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO df_publisher_keys (key, seen_at)
            VALUES ($1, $2)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn acquire_lease(
        &self,
        instance_id: Uuid,
        worker: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO df_leases (instance_id, worker, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id) DO UPDATE
            SET worker = EXCLUDED.worker, expires_at = EXCLUDED.expires_at
            WHERE df_leases.expires_at <= $4 OR df_leases.worker = EXCLUDED.worker
            "#,
        )
        .bind(instance_id)
        .bind(worker)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, instance_id: Uuid, worker: &str) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM df_leases WHERE instance_id = $1 AND worker = $2"#)
            .bind(instance_id)
            .bind(worker)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_lease(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query(
            r#"SELECT worker, expires_at FROM df_leases WHERE instance_id = $1"#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Lease {
            worker: r.get("worker"),
            expires_at: r.get("expires_at"),
        }))
    }

    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO df_dlq (id, instance_id, failed_at, reason, entry)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id)
        .bind(entry.instance_id)
        .bind(entry.failed_at)
        .bind(&entry.reason)
        .bind(to_json(entry)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_dead_letter(
        &self,
        filter: &DlqFilter,
        page: &Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry FROM df_dlq
            WHERE ($1::uuid IS NULL OR instance_id = $1)
              AND ($2::text IS NULL OR reason = $2)
            ORDER BY failed_at DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(filter.instance_id)
        .bind(&filter.reason)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(from_json(row.get::<serde_json::Value, _>("entry"))?);
        }
        Ok(entries)
    }

    async fn take_dead_letter(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(r#"DELETE FROM df_dlq WHERE id = $1 RETURNING entry"#)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_json(r.get::<serde_json::Value, _>("entry")))
            .transpose()
    }

    async fn purge_dead_letter(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(r#"DELETE FROM df_dlq WHERE failed_at < $1"#)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO df_snapshots (id, instance_id, taken_at, snapshot)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.instance_id)
        .bind(snapshot.taken_at)
        .bind(to_json(snapshot)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(r#"SELECT snapshot FROM df_snapshots WHERE id = $1"#)
            .bind(snapshot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_json(r.get::<serde_json::Value, _>("snapshot")))
            .transpose()
    }

    async fn list_snapshots(&self, instance_id: Uuid) -> Result<Vec<SnapshotInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot FROM df_snapshots
            WHERE instance_id = $1
            ORDER BY taken_at DESC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut infos = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshot: Snapshot = from_json(row.get::<serde_json::Value, _>("snapshot"))?;
            infos.push(SnapshotInfo::from(&snapshot));
        }
        Ok(infos)
    }

    async fn purge_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(r#"DELETE FROM df_snapshots WHERE taken_at < $1"#)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn import_instance(
        &self,
        record: &InstanceRecord,
        log: Vec<LogEntry>,
        steps: Vec<StepRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO df_instances
                (id, kind, version, status, state, record, created_at, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.kind)
        .bind(&record.version)
        .bind(record.status.to_string())
        .bind(&record.state)
        .bind(to_json(record)?)
        .bind(record.created_at)
        .bind(record.last_activity_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateInstance(record.id));
        }

        for entry in &log {
            sqlx::query(
                r#"
                INSERT INTO df_log (instance_id, ordinal, kind, entry, at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.id)
            .bind(entry.ordinal as i64)
            .bind(entry.kind.name())
            .bind(to_json(entry)?)
            .bind(entry.at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for step in &steps {
            let mut step = step.clone();
            step.instance_id = record.id;
            Self::put_step_tx(&mut tx, &step).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn purge_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            DELETE FROM df_instances
            WHERE status IN ('completed', 'failed', 'cancelled', 'dead_lettered')
              AND last_activity_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let id: Uuid = row.get("id");
            sqlx::query(r#"DELETE FROM df_log WHERE instance_id = $1"#)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(r#"DELETE FROM df_steps WHERE instance_id = $1"#)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(r#"DELETE FROM df_waits WHERE instance_id = $1"#)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(r#"DELETE FROM df_timers WHERE instance_id = $1"#)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(r#"DELETE FROM df_usage WHERE instance_id = $1"#)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn add_usage(
        &self,
        instance_id: Uuid,
        delta: &ResourceUsage,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO df_usage
                (instance_id, steps_executed, retries, events_consumed,
                 external_calls, store_reads, store_writes, busy_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE SET
                steps_executed = df_usage.steps_executed + EXCLUDED.steps_executed,
                retries = df_usage.retries + EXCLUDED.retries,
                events_consumed = df_usage.events_consumed + EXCLUDED.events_consumed,
                external_calls = df_usage.external_calls + EXCLUDED.external_calls,
                store_reads = df_usage.store_reads + EXCLUDED.store_reads,
                store_writes = df_usage.store_writes + EXCLUDED.store_writes,
                busy_ms = df_usage.busy_ms + EXCLUDED.busy_ms
            "#,
        )
        .bind(instance_id)
        .bind(delta.steps_executed as i64)
        .bind(delta.retries as i64)
        .bind(delta.events_consumed as i64)
        .bind(delta.external_calls as i64)
        .bind(delta.store_reads as i64)
        .bind(delta.store_writes as i64)
        .bind(delta.busy_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_usage(&self, instance_id: Uuid) -> Result<ResourceUsage, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT steps_executed, retries, events_consumed, external_calls,
                   store_reads, store_writes, busy_ms
            FROM df_usage WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row {
            Some(row) => ResourceUsage {
                steps_executed: row.get::<i64, _>("steps_executed") as u64,
                retries: row.get::<i64, _>("retries") as u64,
                events_consumed: row.get::<i64, _>("events_consumed") as u64,
                external_calls: row.get::<i64, _>("external_calls") as u64,
                store_reads: row.get::<i64, _>("store_reads") as u64,
                store_writes: row.get::<i64, _>("store_writes") as u64,
                busy_ms: row.get::<i64, _>("busy_ms") as u64,
            },
            None => ResourceUsage::default(),
        })
    }
}
