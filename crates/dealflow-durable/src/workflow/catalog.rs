//! Definition catalog
//!
//! Process-wide registry of workflow kinds, keyed by kind id and version.
//! Registration happens during startup; the catalog is sealed before the
//! dispatcher starts so lookups never race registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::WorkflowDefinition;

/// Errors from catalog operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog is sealed; definitions register during startup only")]
    Sealed,

    #[error("workflow kind {id:?} version {version:?} is already registered")]
    Duplicate { id: String, version: String },
}

struct Inner {
    // kind id -> version -> definition; BTreeMap keeps versions ordered so
    // `latest` is the last entry
    kinds: HashMap<String, BTreeMap<String, Arc<WorkflowDefinition>>>,
    sealed: bool,
}

/// Registry of workflow kinds
pub struct DefinitionCatalog {
    inner: RwLock<Inner>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                kinds: HashMap::new(),
                sealed: false,
            }),
        }
    }

    /// Register a definition; fails after sealing
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(CatalogError::Sealed);
        }

        let id = definition.id().to_string();
        let version = definition.version().to_string();
        let versions = inner.kinds.entry(id.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(CatalogError::Duplicate { id, version });
        }

        info!(kind = %id, %version, "registered workflow kind");
        versions.insert(version, Arc::new(definition));
        Ok(())
    }

    /// One-shot seal; further registration is rejected
    pub fn seal(&self) {
        self.inner.write().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    /// Definition for an exact (kind, version) pair — what resumes use
    pub fn lookup(&self, kind: &str, version: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.read().kinds.get(kind)?.get(version).cloned()
    }

    /// Newest version of a kind — what creations use
    pub fn latest(&self, kind: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner
            .read()
            .kinds
            .get(kind)?
            .values()
            .next_back()
            .cloned()
    }

    /// All registered kind ids
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.inner.read().kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for DefinitionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StateSpec, Transition};
    use serde_json::json;

    fn definition(version: &str) -> WorkflowDefinition {
        WorkflowDefinition::builder("nda", version)
            .initial("Pending")
            .state(StateSpec::new("Pending").on_enter(|_| async move {
                Ok(Transition::Complete(json!({})))
            }))
            .state(StateSpec::terminal("Expired"))
            .build()
            .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let catalog = DefinitionCatalog::new();
        catalog.register(definition("v1")).unwrap();
        catalog.register(definition("v2")).unwrap();

        assert!(catalog.lookup("nda", "v1").is_some());
        assert_eq!(catalog.latest("nda").unwrap().version(), "v2");
        assert!(catalog.lookup("nda", "v3").is_none());
        assert!(catalog.latest("investment_deal").is_none());
        assert_eq!(catalog.kinds(), vec!["nda".to_string()]);
    }

    #[test]
    fn duplicate_version_rejected() {
        let catalog = DefinitionCatalog::new();
        catalog.register(definition("v1")).unwrap();
        assert!(matches!(
            catalog.register(definition("v1")),
            Err(CatalogError::Duplicate { .. })
        ));
    }

    #[test]
    fn sealed_catalog_rejects_registration() {
        let catalog = DefinitionCatalog::new();
        catalog.register(definition("v1")).unwrap();
        catalog.seal();

        assert!(catalog.is_sealed());
        assert!(matches!(
            catalog.register(definition("v2")),
            Err(CatalogError::Sealed)
        ));
        // Existing definitions stay readable
        assert!(catalog.latest("nda").is_some());
    }
}
