//! # Domain workflows
//!
//! The five long-lived business processes the platform drives on the
//! durable engine, plus the collaborator traits their steps orchestrate.
//!
//! Every definition is a pure function of its collaborators: handlers
//! never reach around the engine to read mutable state, so replays are
//! deterministic by construction.

pub mod ai_analysis;
pub mod collaborators;
pub mod investment;
pub mod media;
pub mod nda;
pub mod production;

pub use collaborators::{
    AnalysisProvider, Collaborators, MediaProcessor, Notifier, SimulatedAnalysisProvider,
    SimulatedMediaProcessor, SimulatedNotifier,
};

use dealflow_durable::EngineBuilder;

/// Register every domain workflow kind on an engine builder
pub fn register_all(builder: EngineBuilder, collaborators: &Collaborators) -> EngineBuilder {
    tracing::info!("registering domain workflow kinds");
    builder
        .register(investment::definition(collaborators))
        .register(production::definition(collaborators))
        .register(nda::definition(collaborators))
        .register(media::definition(collaborators))
        .register(ai_analysis::definition(collaborators))
}
