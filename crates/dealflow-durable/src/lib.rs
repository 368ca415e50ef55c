//! # Durable Workflow Engine
//!
//! Event-sourced orchestration for long-lived, multi-party business
//! processes: deal negotiation, NDA issuance, publishing pipelines and
//! human-gated analysis runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (facade: create / publish / cancel / inspect / drain)      │
//! └──────────────────────────────────────────────────────────────┘
//!         │               │                │             │
//!         ▼               ▼                ▼             ▼
//! ┌─────────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────┐
//! │ Dispatcher  │ │  Event Bus   │ │ TimerService │ │  Debug   │
//! │ (run-queue, │ │ (waits, TTL  │ │ (wall-clock  │ │ (replay, │
//! │  leases)    │ │  queues)     │ │  wake-ups)   │ │  DLQ)    │
//! └─────────────┘ └──────────────┘ └──────────────┘ └──────────┘
//!         │               │                │             │
//!         └───────────────┴────────┬───────┴─────────────┘
//!                                  ▼
//!                     ┌─────────────────────────┐
//!                     │      InstanceStore      │
//!                     │ (log, step records,     │
//!                     │  waits, timers, DLQ)    │
//!                     └─────────────────────────┘
//! ```
//!
//! ## Execution model
//!
//! A state's ingress handler is re-entered from the top on every resume;
//! every prior step short-circuits from its memoized record, so crash
//! recovery is a replay of cheap cache hits followed by live execution
//! from the suspension point. All external input enters through
//! `wait_for_event`, whose payload is frozen into the log — handlers
//! never poll outside state.
//!
//! ## Example
//!
//! ```ignore
//! use dealflow_durable::prelude::*;
//! use serde_json::json;
//!
//! let definition = WorkflowDefinition::builder("order", "v1")
//!     .initial("Placed")
//!     .event("payment_received")
//!     .state(StateSpec::new("Placed").on_enter(|ctx| async move {
//!         ctx.run_step("reserve_stock", json!({}), |_| async {
//!             Ok(json!({"reserved": true}))
//!         })
//!         .await?;
//!         let payment = ctx.wait_for_event("payment_received", None, None).await?;
//!         Ok(Transition::Complete(json!({ "payment": payment })))
//!     }))
//!     .state(StateSpec::terminal("Done"))
//!     .build()?;
//!
//! let engine = Engine::builder().register(definition).build()?;
//! let handle = engine.spawn();
//! ```

pub mod bus;
pub mod clock;
pub mod config;
pub mod debug;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod instance;
pub mod persistence;
pub mod runtime;
pub mod timer;
pub mod workflow;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{BusError, EventEnvelope, PublishOutcome};
    pub use crate::clock::{Clock, MockClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder, EngineError, StatusView};
    pub use crate::error::{ErrorKind, StepFailure};
    pub use crate::instance::{InstanceRecord, InstanceStatus, LogEntry, LogEntryKind};
    pub use crate::persistence::{
        InstanceStore, MemoryInstanceStore, PostgresInstanceStore, StoreError,
    };
    pub use crate::runtime::{
        ApprovalOutcome, Interrupt, ParallelBranch, RetryPolicy, StepContext, StepOptions,
    };
    pub use crate::workflow::{
        DefinitionCatalog, StateSpec, Transition, WorkflowDefinition,
    };
}

// Re-export key types at the crate root
pub use bus::{BusError, EventBus, EventEnvelope, PublishOutcome};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::EngineConfig;
pub use debug::{DebugError, DebugSurface, InspectionReport, ReplayOptions, ReplayedState};
pub use dispatcher::{DispatchError, Dispatcher};
pub use engine::{Engine, EngineBuilder, EngineError, EngineHandle, MaintenanceReport, StatusView};
pub use error::{ErrorKind, StepFailure};
pub use instance::{
    DeadLetterEntry, InstanceRecord, InstanceStatus, LogEntry, LogEntryKind, PendingTimer,
    PendingWait, ResourceUsage, Snapshot, SnapshotInfo, StepKey, StepRecord,
};
pub use persistence::{
    DlqFilter, InstanceStore, MemoryInstanceStore, Pagination, PostgresInstanceStore, StoreError,
};
pub use runtime::{
    ApprovalOutcome, Interrupt, ParallelBranch, RetryPolicy, StepContext, StepOptions,
    SuspendReason,
};
pub use timer::TimerService;
pub use workflow::{
    CatalogError, DefinitionCatalog, DefinitionError, StateSpec, Transition, WorkflowDefinition,
};
