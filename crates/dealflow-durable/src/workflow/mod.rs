//! Workflow definitions
//!
//! A [`WorkflowDefinition`] declares a finite state set with one initial
//! state, per-state ingress handlers, guards, compensations and timeouts,
//! and the external-event vocabulary with payload validators. Definitions
//! are immutable once registered; instances capture the version they were
//! created with and run on it to completion.

mod catalog;

pub use catalog::{CatalogError, DefinitionCatalog};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::StepFailure;
use crate::runtime::{Interrupt, RetryPolicy, StepContext};

/// Command returned by a state ingress handler
///
/// Transitions are driven solely by these; an instance never polls
/// external state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Remain in the current state, parked until an event or timer wakes
    /// the instance again
    Stay,

    /// Enter another state
    GoTo(String),

    /// Terminate successfully with an output payload
    Complete(serde_json::Value),

    /// Terminate with a failure
    Fail(StepFailure),
}

impl Transition {
    /// Convenience constructor taking any string-ish state name
    pub fn go(state: impl Into<String>) -> Self {
        Self::GoTo(state.into())
    }
}

/// Boxed ingress handler
pub type StateHandler =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Transition, Interrupt>> + Send + Sync>;

/// Boxed compensation handler
pub type CompensationHandler =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<(), Interrupt>> + Send + Sync>;

/// Guard over the instance input, checked on every entry of the state
pub type GuardFn = Arc<dyn Fn(&serde_json::Value) -> Result<(), StepFailure> + Send + Sync>;

/// Payload validator for a declared event
pub type PayloadValidator =
    Arc<dyn Fn(&serde_json::Value) -> Result<(), StepFailure> + Send + Sync>;

/// Per-state timeout with the state entered on expiry
#[derive(Clone)]
pub struct StateTimeout {
    pub after: Duration,
    pub then: String,
}

/// Whole-instance timeout; `then: None` fails the instance
#[derive(Clone)]
pub struct OverallTimeout {
    pub after: Duration,
    pub then: Option<String>,
}

/// A declared external event
#[derive(Clone)]
pub struct EventSpec {
    pub name: String,
    pub validator: Option<PayloadValidator>,
}

/// One state of a definition
#[derive(Clone)]
pub struct StateSpec {
    pub name: String,
    pub terminal: bool,
    pub handler: Option<StateHandler>,
    pub guard: Option<GuardFn>,
    pub compensation: Option<CompensationHandler>,
    pub timeout: Option<StateTimeout>,
}

impl StateSpec {
    /// A non-terminal state; give it a handler with
    /// [`on_enter`](Self::on_enter)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terminal: false,
            handler: None,
            guard: None,
            compensation: None,
            timeout: None,
        }
    }

    /// A terminal state; without a handler it completes the instance with
    /// `{"finalState": <name>}`
    pub fn terminal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terminal: true,
            handler: None,
            guard: None,
            compensation: None,
            timeout: None,
        }
    }

    /// Ingress handler, executed on entry and on every resume while the
    /// instance remains in the state
    pub fn on_enter<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Transition, Interrupt>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx| handler(ctx).boxed()));
        self
    }

    /// Guard over the instance input; violation raises a deterministic
    /// guard failure
    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), StepFailure> + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// Compensation handler, run when the instance leaves this state on
    /// failure or cancellation; compensations are memoized steps
    pub fn compensate<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Interrupt>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(move |ctx| handler(ctx).boxed()));
        self
    }

    /// Timeout for this state; expiry transitions to `then`
    pub fn timeout(mut self, after: Duration, then: impl Into<String>) -> Self {
        self.timeout = Some(StateTimeout {
            after,
            then: then.into(),
        });
        self
    }
}

/// An immutable workflow kind
#[derive(Clone)]
pub struct WorkflowDefinition {
    id: String,
    version: String,
    initial: String,
    states: Vec<StateSpec>,
    index: HashMap<String, usize>,
    events: Vec<EventSpec>,
    input_validator: Option<PayloadValidator>,
    default_retry: RetryPolicy,
    overall_timeout: Option<OverallTimeout>,
}

impl WorkflowDefinition {
    pub fn builder(id: impl Into<String>, version: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder {
            id: id.into(),
            version: version.into(),
            initial: None,
            states: Vec::new(),
            events: Vec::new(),
            input_validator: None,
            default_retry: RetryPolicy::default(),
            overall_timeout: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn initial_state(&self) -> &str {
        &self.initial
    }

    pub fn state(&self, name: &str) -> Option<&StateSpec> {
        self.index.get(name).map(|i| &self.states[*i])
    }

    /// Declared states in declaration order
    pub fn states(&self) -> impl Iterator<Item = &StateSpec> {
        self.states.iter()
    }

    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    pub fn overall_timeout(&self) -> Option<&OverallTimeout> {
        self.overall_timeout.as_ref()
    }

    /// Whether the event name is part of this kind's vocabulary
    pub fn declares_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name == name)
    }

    /// Validate an event payload against the declared schema
    pub fn validate_event(&self, name: &str, payload: &serde_json::Value) -> Result<(), StepFailure> {
        match self.events.iter().find(|e| e.name == name) {
            Some(spec) => match &spec.validator {
                Some(validator) => validator(payload),
                None => Ok(()),
            },
            None => Err(StepFailure::validation(format!(
                "event {name:?} is not declared by workflow kind {:?}",
                self.id
            ))),
        }
    }

    /// Validate an instance input
    pub fn validate_input(&self, input: &serde_json::Value) -> Result<(), StepFailure> {
        match &self.input_validator {
            Some(validator) => validator(input),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("initial", &self.initial)
            .field("states", &self.states.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("events", &self.events.iter().map(|e| &e.name).collect::<Vec<_>>())
            .finish()
    }
}

/// Errors raised while assembling a definition
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition {0:?} has no states")]
    NoStates(String),

    #[error("definition {0:?} declares no initial state")]
    NoInitialState(String),

    #[error("initial state {0:?} is not declared")]
    UnknownInitialState(String),

    #[error("duplicate state {0:?}")]
    DuplicateState(String),

    #[error("definition {0:?} declares no terminal state")]
    NoTerminalState(String),

    #[error("non-terminal state {0:?} has no handler")]
    MissingHandler(String),

    #[error("state {state:?} timeout targets undeclared state {target:?}")]
    UnknownTimeoutTarget { state: String, target: String },
}

/// Builder for [`WorkflowDefinition`]
pub struct DefinitionBuilder {
    id: String,
    version: String,
    initial: Option<String>,
    states: Vec<StateSpec>,
    events: Vec<EventSpec>,
    input_validator: Option<PayloadValidator>,
    default_retry: RetryPolicy,
    overall_timeout: Option<OverallTimeout>,
}

impl DefinitionBuilder {
    /// Declare the initial state name
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Add a state
    pub fn state(mut self, spec: StateSpec) -> Self {
        self.states.push(spec);
        self
    }

    /// Declare an external event without payload validation
    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.events.push(EventSpec {
            name: name.into(),
            validator: None,
        });
        self
    }

    /// Declare an external event with a payload validator
    pub fn event_with<F>(mut self, name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), StepFailure> + Send + Sync + 'static,
    {
        self.events.push(EventSpec {
            name: name.into(),
            validator: Some(Arc::new(validator)),
        });
        self
    }

    /// Validator applied to the input payload at creation
    pub fn validate_input<F>(mut self, validator: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), StepFailure> + Send + Sync + 'static,
    {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    /// Default retry policy for steps of this kind
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Whole-instance timeout; `then: None` fails the instance on expiry
    pub fn overall_timeout(mut self, after: Duration, then: Option<String>) -> Self {
        self.overall_timeout = Some(OverallTimeout { after, then });
        self
    }

    /// Validate and freeze the definition
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.states.is_empty() {
            return Err(DefinitionError::NoStates(self.id));
        }

        let mut index = HashMap::new();
        for (i, state) in self.states.iter().enumerate() {
            if index.insert(state.name.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateState(state.name.clone()));
            }
        }

        let initial = self.initial.ok_or(DefinitionError::NoInitialState(self.id.clone()))?;
        if !index.contains_key(&initial) {
            return Err(DefinitionError::UnknownInitialState(initial));
        }

        if !self.states.iter().any(|s| s.terminal) {
            return Err(DefinitionError::NoTerminalState(self.id));
        }

        for state in &self.states {
            if !state.terminal && state.handler.is_none() {
                return Err(DefinitionError::MissingHandler(state.name.clone()));
            }
            if let Some(timeout) = &state.timeout {
                if !index.contains_key(&timeout.then) {
                    return Err(DefinitionError::UnknownTimeoutTarget {
                        state: state.name.clone(),
                        target: timeout.then.clone(),
                    });
                }
            }
        }

        Ok(WorkflowDefinition {
            id: self.id,
            version: self.version,
            initial,
            states: self.states,
            index,
            events: self.events,
            input_validator: self.input_validator,
            default_retry: self.default_retry,
            overall_timeout: self.overall_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> DefinitionBuilder {
        WorkflowDefinition::builder("test_kind", "v1")
            .initial("Start")
            .state(StateSpec::new("Start").on_enter(|_ctx| async move {
                Ok(Transition::Complete(json!({"done": true})))
            }))
            .state(StateSpec::terminal("Done"))
    }

    #[test]
    fn build_validates_initial_state() {
        let result = WorkflowDefinition::builder("k", "v1")
            .initial("Missing")
            .state(StateSpec::terminal("Done"))
            .build();
        assert!(matches!(result, Err(DefinitionError::UnknownInitialState(_))));
    }

    #[test]
    fn build_requires_terminal_state() {
        let result = WorkflowDefinition::builder("k", "v1")
            .initial("Start")
            .state(StateSpec::new("Start").on_enter(|_| async { Ok(Transition::Stay) }))
            .build();
        assert!(matches!(result, Err(DefinitionError::NoTerminalState(_))));
    }

    #[test]
    fn build_rejects_handlerless_states() {
        let result = WorkflowDefinition::builder("k", "v1")
            .initial("Start")
            .state(StateSpec::new("Start"))
            .state(StateSpec::terminal("Done"))
            .build();
        assert!(matches!(result, Err(DefinitionError::MissingHandler(_))));
    }

    #[test]
    fn build_rejects_duplicate_states() {
        let result = minimal().state(StateSpec::terminal("Done")).build();
        assert!(matches!(result, Err(DefinitionError::DuplicateState(_))));
    }

    #[test]
    fn build_checks_timeout_targets() {
        let result = WorkflowDefinition::builder("k", "v1")
            .initial("Start")
            .state(
                StateSpec::new("Start")
                    .on_enter(|_| async { Ok(Transition::Stay) })
                    .timeout(Duration::from_secs(60), "Nowhere"),
            )
            .state(StateSpec::terminal("Done"))
            .build();
        assert!(matches!(
            result,
            Err(DefinitionError::UnknownTimeoutTarget { .. })
        ));
    }

    #[test]
    fn event_validation() {
        let def = minimal()
            .event("qualify")
            .event_with("payment_received", |payload| {
                payload
                    .get("amount")
                    .and_then(|v| v.as_u64())
                    .map(|_| ())
                    .ok_or_else(|| StepFailure::validation("amount required"))
            })
            .build()
            .unwrap();

        assert!(def.declares_event("qualify"));
        assert!(!def.declares_event("unknown"));
        assert!(def.validate_event("qualify", &json!({})).is_ok());
        assert!(def.validate_event("payment_received", &json!({})).is_err());
        assert!(def
            .validate_event("payment_received", &json!({"amount": 100}))
            .is_ok());
        assert!(def.validate_event("unknown", &json!({})).is_err());
    }

    #[test]
    fn state_lookup() {
        let def = minimal().build().unwrap();
        assert_eq!(def.initial_state(), "Start");
        assert!(def.state("Start").is_some());
        assert!(def.state("Done").unwrap().terminal);
        assert!(def.state("Missing").is_none());
    }
}
