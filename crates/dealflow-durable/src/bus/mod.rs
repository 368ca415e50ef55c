//! Event bus
//!
//! Routes published external events to pending waits. Delivery to a wait
//! is exactly-once: matching, step-record settlement and the
//! `EventArrived` append happen in one store transaction that also removes
//! the wait. Events published before any matching wait are held in a
//! bounded per-name queue with a TTL; overflow spills the oldest entry to
//! the event dead-letter list.

use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::StepFailure;
use crate::instance::{InstanceRecord, QueuedEvent};
use crate::persistence::{EnqueueOutcome, InstanceStore, StoreError, WaitOutcome};
use crate::workflow::DefinitionCatalog;

/// A published event
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub name: String,
    pub correlation_key: Option<String>,
    pub payload: serde_json::Value,
    /// Duplicate publisher keys are deduplicated
    pub publisher_key: Option<String>,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            correlation_key: None,
            payload,
            publisher_key: None,
        }
    }

    pub fn with_correlation(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn with_publisher_key(mut self, key: impl Into<String>) -> Self {
        self.publisher_key = Some(key.into());
        self
    }
}

/// What happened to a published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Consumed by a pending wait of this instance; the dispatcher should
    /// wake it
    Delivered { instance_id: Uuid },

    /// No wait matched; held for late subscribers
    Queued,

    /// No wait matched and the per-name queue was full; the oldest entry
    /// spilled to the event dead-letter list
    SpilledOldest,

    /// The publisher idempotency key was already seen
    Duplicate,
}

/// Errors from publish operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no pending wait matches event {0:?}")]
    NoMatchingWait(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("instance {0} is terminal")]
    Terminal(Uuid),

    #[error("event {event:?} is not declared by workflow kind {kind:?}")]
    UndeclaredEvent { kind: String, event: String },

    #[error("event payload rejected: {0}")]
    Validation(StepFailure),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// The bus
pub struct EventBus {
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    catalog: Arc<DefinitionCatalog>,
    config: Arc<EngineConfig>,
}

impl EventBus {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        catalog: Arc<DefinitionCatalog>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            catalog,
            config,
        }
    }

    /// Publish to whichever instance is waiting; queue when none is
    #[instrument(skip(self, envelope), fields(event = %envelope.name))]
    pub async fn publish(&self, envelope: EventEnvelope) -> Result<PublishOutcome, BusError> {
        let now = self.clock.now();

        if let Some(key) = &envelope.publisher_key {
            if !self.store.record_publisher_key(key, now).await? {
                debug!(publisher_key = %key, "duplicate publish dropped");
                return Ok(PublishOutcome::Duplicate);
            }
        }

        // Another publisher may consume the wait between peek and
        // completion; retry the match a few times before queueing.
        for _ in 0..3 {
            let Some(wait) = self
                .store
                .find_wait(&envelope.name, envelope.correlation_key.as_deref(), None)
                .await?
            else {
                break;
            };

            let record = self.store.get_instance(wait.instance_id).await?;
            self.validate(&record, &envelope)?;

            if let Some(done) = self
                .store
                .complete_wait(
                    wait.id,
                    &WaitOutcome::Delivered(envelope.payload.clone()),
                    now,
                )
                .await?
            {
                debug!(instance_id = %done.instance_id, "event delivered to wait");
                return Ok(PublishOutcome::Delivered {
                    instance_id: done.instance_id,
                });
            }
        }

        let queued = QueuedEvent {
            id: Uuid::now_v7(),
            name: envelope.name.clone(),
            correlation_key: envelope.correlation_key.clone(),
            payload: envelope.payload,
            published_at: now,
            expires_at: now
                + TimeDelta::from_std(self.config.queued_event_ttl)
                    .unwrap_or_else(|_| TimeDelta::MAX),
        };

        match self
            .store
            .enqueue_event(&queued, self.config.max_queued_events_per_name)
            .await?
        {
            EnqueueOutcome::Queued => Ok(PublishOutcome::Queued),
            EnqueueOutcome::SpilledOldest => Ok(PublishOutcome::SpilledOldest),
        }
    }

    /// Publish to one instance; fails instead of queueing when it has no
    /// matching wait
    #[instrument(skip(self, envelope), fields(event = %envelope.name))]
    pub async fn publish_to(
        &self,
        instance_id: Uuid,
        envelope: EventEnvelope,
    ) -> Result<PublishOutcome, BusError> {
        let now = self.clock.now();

        let record = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|_| BusError::InstanceNotFound(instance_id))?;
        if record.status.is_terminal() {
            return Err(BusError::Terminal(instance_id));
        }

        self.validate(&record, &envelope)?;

        if let Some(key) = &envelope.publisher_key {
            if !self.store.record_publisher_key(key, now).await? {
                return Ok(PublishOutcome::Duplicate);
            }
        }

        let wait = self
            .store
            .find_wait(
                &envelope.name,
                envelope.correlation_key.as_deref(),
                Some(instance_id),
            )
            .await?
            .ok_or_else(|| BusError::NoMatchingWait(envelope.name.clone()))?;

        match self
            .store
            .complete_wait(wait.id, &WaitOutcome::Delivered(envelope.payload), now)
            .await?
        {
            Some(_) => Ok(PublishOutcome::Delivered { instance_id }),
            None => Err(BusError::NoMatchingWait(envelope.name)),
        }
    }

    /// Validate the payload against the instance kind's declared schema
    fn validate(&self, record: &InstanceRecord, envelope: &EventEnvelope) -> Result<(), BusError> {
        let definition = self
            .catalog
            .lookup(&record.kind, &record.version)
            .or_else(|| self.catalog.latest(&record.kind));

        let Some(definition) = definition else {
            // No definition registered in this process; deliver as-is
            return Ok(());
        };

        if !definition.declares_event(&envelope.name) {
            return Err(BusError::UndeclaredEvent {
                kind: record.kind.clone(),
                event: envelope.name.clone(),
            });
        }
        definition
            .validate_event(&envelope.name, &envelope.payload)
            .map_err(BusError::Validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{PendingWait, StepKey};
    use crate::persistence::MemoryInstanceStore;
    use crate::workflow::{StateSpec, Transition, WorkflowDefinition};
    use crate::MockClock;
    use chrono::Utc;
    use serde_json::json;

    fn catalog_with_kind() -> Arc<DefinitionCatalog> {
        let catalog = DefinitionCatalog::new();
        catalog
            .register(
                WorkflowDefinition::builder("deal", "v1")
                    .initial("Start")
                    .event("qualify")
                    .event_with("payment_received", |p| {
                        p.get("amount")
                            .and_then(|v| v.as_u64())
                            .map(|_| ())
                            .ok_or_else(|| StepFailure::validation("amount required"))
                    })
                    .state(StateSpec::new("Start").on_enter(|_| async { Ok(Transition::Stay) }))
                    .state(StateSpec::terminal("Done"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(catalog)
    }

    async fn bus_fixture() -> (Arc<MemoryInstanceStore>, EventBus, Uuid) {
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = MockClock::from_system();
        let catalog = catalog_with_kind();
        let config = Arc::new(EngineConfig::default());

        let record =
            InstanceRecord::new(Uuid::now_v7(), "deal", "v1", "Start", json!({}), clock.now());
        store.create_instance(&record, None).await.unwrap();

        let bus = EventBus::new(
            store.clone() as Arc<dyn InstanceStore>,
            clock as Arc<dyn Clock>,
            catalog,
            config,
        );
        (store, bus, record.id)
    }

    fn wait(instance_id: Uuid, event: &str) -> PendingWait {
        PendingWait {
            id: Uuid::now_v7(),
            instance_id,
            event_name: event.to_string(),
            correlation_key: None,
            deadline: None,
            step: StepKey::compose(format!("wait:{event}"), 0, 0),
            approval: None,
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_waiting_instance() {
        let (store, bus, instance_id) = bus_fixture().await;
        store.put_wait(&wait(instance_id, "qualify")).await.unwrap();

        let outcome = bus
            .publish(EventEnvelope::new("qualify", json!({"qualified": true})))
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Delivered { instance_id });
        assert_eq!(store.wait_count(), 0);
    }

    #[tokio::test]
    async fn publish_without_wait_queues() {
        let (_store, bus, _instance_id) = bus_fixture().await;

        let outcome = bus
            .publish(EventEnvelope::new("qualify", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
    }

    #[tokio::test]
    async fn duplicate_publisher_key_is_dropped() {
        let (_store, bus, _instance_id) = bus_fixture().await;

        let envelope =
            EventEnvelope::new("qualify", json!({})).with_publisher_key("pub-1");
        assert_eq!(
            bus.publish(envelope.clone()).await.unwrap(),
            PublishOutcome::Queued
        );
        assert_eq!(
            bus.publish(envelope).await.unwrap(),
            PublishOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn payload_validator_rejects_bad_events() {
        let (store, bus, instance_id) = bus_fixture().await;
        store
            .put_wait(&wait(instance_id, "payment_received"))
            .await
            .unwrap();

        let result = bus
            .publish(EventEnvelope::new("payment_received", json!({"amount": "oops"})))
            .await;
        assert!(matches!(result, Err(BusError::Validation(_))));
        // The wait is not consumed by an invalid payload
        assert_eq!(store.wait_count(), 1);
    }

    #[tokio::test]
    async fn publish_to_requires_matching_wait() {
        let (store, bus, instance_id) = bus_fixture().await;

        let result = bus
            .publish_to(instance_id, EventEnvelope::new("qualify", json!({})))
            .await;
        assert!(matches!(result, Err(BusError::NoMatchingWait(_))));

        store.put_wait(&wait(instance_id, "qualify")).await.unwrap();
        let outcome = bus
            .publish_to(instance_id, EventEnvelope::new("qualify", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered { instance_id });
    }

    #[tokio::test]
    async fn publish_to_rejects_undeclared_event() {
        let (_store, bus, instance_id) = bus_fixture().await;

        let result = bus
            .publish_to(instance_id, EventEnvelope::new("mystery", json!({})))
            .await;
        assert!(matches!(result, Err(BusError::UndeclaredEvent { .. })));
    }

    #[tokio::test]
    async fn publish_to_unknown_instance_fails() {
        let (_store, bus, _instance_id) = bus_fixture().await;

        let result = bus
            .publish_to(Uuid::now_v7(), EventEnvelope::new("qualify", json!({})))
            .await;
        assert!(matches!(result, Err(BusError::InstanceNotFound(_))));
    }
}
