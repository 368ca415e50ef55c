//! Engine facade
//!
//! Bundles the store, clock, timer service, event bus, dispatcher,
//! catalog and debug surface behind one handle. Embedders and the HTTP
//! control plane talk to this; tests drive it deterministically with
//! [`drain`](Engine::drain) and a mock clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::{BusError, EventBus, EventEnvelope, PublishOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::debug::{DebugError, DebugSurface};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::error::ErrorKind;
use crate::instance::{
    DeadLetterEntry, InstanceRecord, InstanceStatus, LogEntry, PendingTimer, PendingWait,
    SnapshotInfo,
};
use crate::persistence::{
    DlqFilter, InstanceStore, MemoryInstanceStore, Pagination, StoreError,
};
use crate::timer::TimerService;
use crate::workflow::{CatalogError, DefinitionCatalog, WorkflowDefinition};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Umbrella error for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Debug(#[from] DebugError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("fast-forward is disabled; enable allow_fast_forward to use it")]
    FastForwardDisabled,
}

/// Answer to a status query, served from the materialised record
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub instance_id: Uuid,
    pub kind: String,
    pub version: String,
    pub state: String,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub failure: Option<crate::error::StepFailure>,
    pub pending_waits: Vec<PendingWait>,
    pub pending_timers: Vec<PendingTimer>,
}

/// What one maintenance pass removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub instances_purged: u64,
    pub dead_letters_purged: u64,
    pub snapshots_purged: u64,
    pub events_expired: u64,
}

struct EngineInner {
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    catalog: Arc<DefinitionCatalog>,
    dispatcher: Dispatcher,
    bus: EventBus,
    timers: Arc<TimerService>,
    debug: DebugSurface,
}

/// The engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Handles for a running engine's background tasks
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal shutdown and wait for workers, timer pump and maintenance
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Builder wiring stores, clocks and definitions into an [`Engine`]
pub struct EngineBuilder {
    store: Option<Arc<dyn InstanceStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
    definitions: Vec<WorkflowDefinition>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            clock: None,
            config: EngineConfig::default(),
            definitions: Vec::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a workflow kind; the catalog is sealed at build
    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn build(self) -> Result<Engine, CatalogError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryInstanceStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = Arc::new(self.config);

        let catalog = DefinitionCatalog::new();
        for definition in self.definitions {
            catalog.register(definition)?;
        }
        catalog.seal();
        let catalog = Arc::new(catalog);

        let dispatcher = Dispatcher::new(
            store.clone(),
            clock.clone(),
            catalog.clone(),
            config.clone(),
        );
        let bus = EventBus::new(
            store.clone(),
            clock.clone(),
            catalog.clone(),
            config.clone(),
        );
        let timers = Arc::new(TimerService::new(
            store.clone(),
            clock.clone(),
            config.clone(),
        ));
        let debug = DebugSurface::new(store.clone(), clock.clone(), config.clone());

        Ok(Engine {
            inner: Arc::new(EngineInner {
                store,
                clock,
                config,
                catalog,
                dispatcher,
                bus,
                timers,
                debug,
            }),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    /// Create an instance of the newest version of `kind`
    pub async fn create(
        &self,
        kind: &str,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Uuid, EngineError> {
        Ok(self
            .inner
            .dispatcher
            .start_instance(kind, input, idempotency_key)
            .await?)
    }

    /// Publish an event to whichever instance is waiting on it
    pub async fn publish(&self, envelope: EventEnvelope) -> Result<PublishOutcome, EngineError> {
        let outcome = self.inner.bus.publish(envelope).await?;
        if let PublishOutcome::Delivered { instance_id } = &outcome {
            self.inner.dispatcher.enqueue(*instance_id);
        }
        Ok(outcome)
    }

    /// Publish an event to one instance; fails when it has no matching wait
    pub async fn publish_to(
        &self,
        instance_id: Uuid,
        envelope: EventEnvelope,
    ) -> Result<PublishOutcome, EngineError> {
        let outcome = self.inner.bus.publish_to(instance_id, envelope).await?;
        if matches!(outcome, PublishOutcome::Delivered { .. }) {
            self.inner.dispatcher.enqueue(instance_id);
        }
        Ok(outcome)
    }

    /// Request cooperative cancellation
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<(), EngineError> {
        Ok(self.inner.dispatcher.cancel(instance_id, reason).await?)
    }

    /// Materialised status without replay
    pub async fn status(&self, instance_id: Uuid) -> Result<StatusView, EngineError> {
        let record = self.inner.store.get_instance(instance_id).await?;
        Ok(StatusView {
            instance_id,
            kind: record.kind.clone(),
            version: record.version.clone(),
            state: record.state.clone(),
            status: record.status,
            started_at: record.created_at,
            last_activity_at: record.last_activity_at,
            output: record.output.clone(),
            failure: record.failure.clone(),
            pending_waits: self.inner.store.list_waits(instance_id).await?,
            pending_timers: self.inner.store.list_timers(instance_id).await?,
        })
    }

    /// Page through the event log
    pub async fn log(
        &self,
        instance_id: Uuid,
        from_ordinal: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, EngineError> {
        Ok(self
            .inner
            .store
            .read_log(instance_id, from_ordinal, limit)
            .await?)
    }

    // =========================================================================
    // Debug surface passthroughs
    // =========================================================================

    pub fn debug(&self) -> &DebugSurface {
        &self.inner.debug
    }

    /// Fork a new instance from a snapshot; the fork is enqueued when
    /// still active
    pub async fn restore_snapshot(&self, snapshot_id: Uuid) -> Result<Uuid, EngineError> {
        let record = self.inner.debug.restore_snapshot(snapshot_id).await?;
        if record.status.is_active() {
            self.inner.dispatcher.enqueue(record.id);
        }
        Ok(record.id)
    }

    pub async fn take_snapshot(
        &self,
        instance_id: Uuid,
        label: &str,
    ) -> Result<SnapshotInfo, EngineError> {
        Ok(self.inner.debug.take_snapshot(instance_id, label).await?)
    }

    /// Park a failed instance in the dead-letter queue
    pub async fn dead_letter(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<DeadLetterEntry, EngineError> {
        Ok(self.inner.debug.dead_letter(instance_id, reason).await?)
    }

    /// Retry a dead-letter entry and put its instance back on the queue
    pub async fn retry_dead_letter(
        &self,
        entry_id: Uuid,
        reset_kinds: Option<&[ErrorKind]>,
    ) -> Result<Uuid, EngineError> {
        let instance_id = self
            .inner
            .debug
            .retry_dead_letter(entry_id, reset_kinds)
            .await?;
        self.inner.dispatcher.enqueue(instance_id);
        Ok(instance_id)
    }

    pub async fn list_dead_letter(
        &self,
        filter: &DlqFilter,
        page: &Pagination,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        Ok(self.inner.debug.list_dead_letter(filter, page).await?)
    }

    /// Active instances with no recent log activity
    pub async fn list_stuck(&self) -> Result<Vec<InstanceRecord>, EngineError> {
        Ok(self.inner.debug.list_stuck().await?)
    }

    /// Inject synthetic timeouts into an instance's pending waits
    pub async fn force_timeout(&self, instance_id: Uuid) -> Result<u32, EngineError> {
        let resolved = self.inner.debug.force_timeout(instance_id).await?;
        if resolved > 0 {
            self.inner.dispatcher.enqueue(instance_id);
        }
        Ok(resolved)
    }

    /// Approve an instance's pending review gates (gated by config)
    pub async fn auto_approve(&self, instance_id: Uuid) -> Result<u32, EngineError> {
        let approved = self.inner.debug.auto_approve(instance_id).await?;
        if approved > 0 {
            self.inner.dispatcher.enqueue(instance_id);
        }
        Ok(approved)
    }

    /// Migration-only shortcut: push synthetic events through the normal
    /// delivery path (guards still run). Disabled unless the engine is
    /// configured with `allow_fast_forward`.
    pub async fn fast_forward(
        &self,
        instance_id: Uuid,
        events: Vec<EventEnvelope>,
    ) -> Result<(), EngineError> {
        if !self.inner.config.allow_fast_forward {
            return Err(EngineError::FastForwardDisabled);
        }
        for envelope in events {
            self.publish_to(instance_id, envelope).await?;
            self.drain().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Process queued work and due timers inline until nothing is ready
    ///
    /// The deterministic mode used by tests and synchronous embedders.
    pub async fn drain(&self) -> Result<(), EngineError> {
        loop {
            let processed = self.inner.dispatcher.drain().await?;
            let fired = self
                .inner
                .timers
                .pump_once(&self.inner.dispatcher)
                .await?;
            if processed == 0 && fired == 0 {
                return Ok(());
            }
        }
    }

    /// Start background workers, the timer pump and the maintenance loop
    pub fn spawn(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = self.inner.dispatcher.spawn_workers(shutdown_rx.clone());
        tasks.push(
            self.inner
                .timers
                .clone()
                .spawn(self.inner.dispatcher.clone(), shutdown_rx.clone()),
        );

        let engine = self.clone();
        let mut maintenance_shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.run_maintenance_once().await {
                            Ok(report) => info!(?report, "maintenance pass"),
                            Err(e) => error!("maintenance pass failed: {e}"),
                        }
                    }
                    _ = maintenance_shutdown.changed() => break,
                }
            }
        }));

        info!(
            workers = self.inner.config.worker_count,
            "engine background tasks started"
        );
        EngineHandle { shutdown_tx, tasks }
    }

    /// Re-queue everything the store considers active (startup recovery)
    pub async fn recover(&self) -> Result<u32, EngineError> {
        let active = self.inner.store.list_active().await?;
        let count = active.len() as u32;
        for record in active {
            self.inner.dispatcher.enqueue(record.id);
        }
        info!(count, "re-queued active instances after restart");
        Ok(count)
    }

    /// Apply the retention policy once
    pub async fn run_maintenance_once(&self) -> Result<MaintenanceReport, EngineError> {
        let now = self.inner.clock.now();
        let cutoff = |retention: Duration| {
            now - TimeDelta::from_std(retention).unwrap_or_else(|_| TimeDelta::MAX)
        };

        Ok(MaintenanceReport {
            instances_purged: self
                .inner
                .store
                .purge_instances(cutoff(self.inner.config.instance_retention))
                .await?,
            dead_letters_purged: self
                .inner
                .store
                .purge_dead_letter(cutoff(self.inner.config.dlq_retention))
                .await?,
            snapshots_purged: self
                .inner
                .store
                .purge_snapshots(cutoff(self.inner.config.snapshot_retention))
                .await?,
            events_expired: self.inner.store.expire_events(now).await?,
        })
    }

    // =========================================================================
    // Component access
    // =========================================================================

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &DefinitionCatalog {
        &self.inner.catalog
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StateSpec, Transition};
    use crate::MockClock;
    use serde_json::json;

    fn echo_kind() -> WorkflowDefinition {
        WorkflowDefinition::builder("echo", "v1")
            .initial("Waiting")
            .event("say")
            .state(StateSpec::new("Waiting").on_enter(|ctx| async move {
                let payload = ctx.wait_for_event("say", None, None).await?;
                Ok(Transition::Complete(json!({ "echo": payload })))
            }))
            .state(StateSpec::terminal("Done"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn create_publish_complete() {
        let engine = Engine::builder()
            .clock(MockClock::from_system())
            .register(echo_kind())
            .build()
            .unwrap();

        let id = engine.create("echo", json!({}), None).await.unwrap();
        engine.drain().await.unwrap();

        let status = engine.status(id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Suspended);
        assert_eq!(status.pending_waits.len(), 1);

        let outcome = engine
            .publish(EventEnvelope::new("say", json!({"hello": "world"})))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered { instance_id: id });
        engine.drain().await.unwrap();

        let status = engine.status(id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Completed);
        assert_eq!(status.output, Some(json!({"echo": {"hello": "world"}})));
        assert!(status.pending_waits.is_empty());
    }

    #[tokio::test]
    async fn fast_forward_requires_config_flag() {
        let engine = Engine::builder().register(echo_kind()).build().unwrap();
        let id = engine.create("echo", json!({}), None).await.unwrap();

        let result = engine
            .fast_forward(id, vec![EventEnvelope::new("say", json!({}))])
            .await;
        assert!(matches!(result, Err(EngineError::FastForwardDisabled)));
    }

    #[tokio::test]
    async fn catalog_is_sealed_after_build() {
        let engine = Engine::builder().register(echo_kind()).build().unwrap();
        assert!(engine.catalog().is_sealed());
        assert!(engine.catalog().register(echo_kind()).is_err());
    }

    #[tokio::test]
    async fn recover_requeues_active_instances() {
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = MockClock::from_system();

        // First engine: create and park an instance, then "crash"
        let engine = Engine::builder()
            .store(store.clone() as Arc<dyn InstanceStore>)
            .clock(clock.clone())
            .register(echo_kind())
            .build()
            .unwrap();
        let id = engine.create("echo", json!({}), None).await.unwrap();
        engine.drain().await.unwrap();
        drop(engine);

        // Second engine over the same store picks the instance back up
        let engine = Engine::builder()
            .store(store as Arc<dyn InstanceStore>)
            .clock(clock)
            .register(echo_kind())
            .build()
            .unwrap();
        assert_eq!(engine.recover().await.unwrap(), 1);

        engine
            .publish(EventEnvelope::new("say", json!("again")))
            .await
            .unwrap();
        engine.drain().await.unwrap();

        let status = engine.status(id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Completed);
    }
}
