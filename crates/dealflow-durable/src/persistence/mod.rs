//! Persistence layer
//!
//! The [`InstanceStore`] trait is the engine's only durable dependency;
//! [`MemoryInstanceStore`] backs tests and single-node use,
//! [`PostgresInstanceStore`] is the production backend.

mod memory;
mod postgres;
mod store;

pub use memory::MemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use store::{
    DlqFilter, EnqueueOutcome, InstanceStore, Pagination, SpilledEvent, StoreError, WaitOutcome,
};
