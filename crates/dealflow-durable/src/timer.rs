//! Timer service
//!
//! Schedules wall-clock wake-ups and pumps due timers into the
//! dispatcher. Delivery is at-least-once: the dispatcher deduplicates by
//! removing the timer row before acting. On restart the pending set is
//! simply re-read from the store; nothing lives only in memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::instance::{PendingTimer, TimerPurpose};
use crate::persistence::{InstanceStore, StoreError};

/// The timer service
pub struct TimerService {
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl TimerService {
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

    /// Schedule a wake-up for an instance after `duration`
    pub async fn schedule(
        &self,
        instance_id: Uuid,
        duration: Duration,
        purpose: TimerPurpose,
    ) -> Result<Uuid, StoreError> {
        let timer = PendingTimer {
            id: Uuid::now_v7(),
            instance_id,
            fire_at: self.clock.now()
                + TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::MAX),
            purpose,
        };
        self.store.put_timer(&timer).await?;
        Ok(timer.id)
    }

    /// Cancel a scheduled wake-up; true when it had not fired yet
    pub async fn cancel(&self, timer_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.store.remove_timer(timer_id).await?.is_some())
    }

    /// Fire everything currently due; returns the number handled
    ///
    /// Timers due within the same pump tick coalesce into one pass. Tests
    /// call this directly after advancing a mock clock.
    pub async fn pump_once(&self, dispatcher: &Dispatcher) -> Result<usize, DispatchError> {
        let due = self.store.due_timers(self.clock.now(), 256).await?;
        let count = due.len();
        for timer in due {
            debug!(timer_id = %timer.id, instance_id = %timer.instance_id, "timer due");
            dispatcher.handle_due_timer(timer).await?;
        }
        Ok(count)
    }

    /// Background pump at the configured resolution
    pub fn spawn(
        self: Arc<Self>,
        dispatcher: Dispatcher,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let resolution = self.config.timer_resolution;
        tokio::spawn(async move {
            info!(resolution_ms = resolution.as_millis() as u64, "timer pump started");
            let mut ticker = tokio::time::interval(resolution);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.pump_once(&dispatcher).await {
                            error!("timer pump failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("timer pump stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::StepKey;
    use crate::persistence::MemoryInstanceStore;
    use crate::workflow::{DefinitionCatalog, StateSpec, Transition, WorkflowDefinition};
    use crate::MockClock;
    use serde_json::json;

    #[tokio::test]
    async fn schedule_and_cancel() {
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = MockClock::from_system();
        let service = TimerService::new(
            store.clone() as Arc<dyn InstanceStore>,
            clock.clone() as Arc<dyn Clock>,
            Arc::new(EngineConfig::default()),
        );

        let instance_id = Uuid::now_v7();
        let timer_id = service
            .schedule(
                instance_id,
                Duration::from_secs(60),
                TimerPurpose::Sleep {
                    step: StepKey::compose("sleep:cooldown", 0, 0),
                },
            )
            .await
            .unwrap();

        assert_eq!(store.timer_count(), 1);
        assert!(service.cancel(timer_id).await.unwrap());
        assert!(!service.cancel(timer_id).await.unwrap());
        assert_eq!(store.timer_count(), 0);
    }

    #[tokio::test]
    async fn pump_fires_due_timers_only() {
        let store = Arc::new(MemoryInstanceStore::new());
        let clock = MockClock::from_system();
        let config = Arc::new(EngineConfig::default());

        let catalog = DefinitionCatalog::new();
        catalog
            .register(
                WorkflowDefinition::builder("napper", "v1")
                    .initial("Napping")
                    .state(StateSpec::new("Napping").on_enter(|ctx| async move {
                        ctx.sleep("nap", Duration::from_secs(30)).await?;
                        Ok(Transition::Complete(json!({"rested": true})))
                    }))
                    .state(StateSpec::terminal("Done"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let catalog = Arc::new(catalog);

        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn InstanceStore>,
            clock.clone() as Arc<dyn Clock>,
            catalog,
            config.clone(),
        );
        let service = TimerService::new(
            store.clone() as Arc<dyn InstanceStore>,
            clock.clone() as Arc<dyn Clock>,
            config,
        );

        let id = dispatcher
            .start_instance("napper", json!({}), None)
            .await
            .unwrap();
        dispatcher.drain().await.unwrap();
        assert_eq!(store.timer_count(), 1);

        // Not yet due
        assert_eq!(service.pump_once(&dispatcher).await.unwrap(), 0);

        clock.advance(Duration::from_secs(31));
        assert_eq!(service.pump_once(&dispatcher).await.unwrap(), 1);
        dispatcher.drain().await.unwrap();

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.output, Some(json!({"rested": true})));
    }
}
