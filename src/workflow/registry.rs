//! Definition Store
//!
//! Keeps every registered version of every workflow definition. Versions
//! are immutable once stored: edits are registered as a new version, and
//! instances always pin the exact version they started with.

use std::collections::BTreeMap;
use std::sync::RwLock;

use log::info;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::{EngineError, Result};

/// Persistence for workflow definitions.
pub trait DefinitionStore: Send + Sync {
    /// Validates and stores a new (name, version) pair.
    fn register(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition>;

    /// Highest active version for a name.
    fn get_latest(&self, name: &str) -> Result<WorkflowDefinition>;

    /// Exact version lookup, active or not.
    fn get_by_name_and_version(&self, name: &str, version: u32) -> Result<WorkflowDefinition>;

    /// Latest active version of every name, optionally filtered by category.
    fn list_active(&self, category: Option<&str>) -> Vec<WorkflowDefinition>;

    /// All versions of one name, ascending.
    fn list_versions(&self, name: &str) -> Vec<WorkflowDefinition>;

    /// Hides a version from `get_latest` without touching running instances.
    fn deactivate(&self, name: &str, version: u32) -> Result<()>;

    /// Every stored definition, for snapshots.
    fn all(&self) -> Vec<WorkflowDefinition>;
}

/// In-memory [`DefinitionStore`].
#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<BTreeMap<String, BTreeMap<u32, WorkflowDefinition>>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, BTreeMap<u32, WorkflowDefinition>>> {
        self.definitions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, BTreeMap<u32, WorkflowDefinition>>> {
        self.definitions.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn register(&self, mut definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        validate_definition(&mut definition)?;

        let mut definitions = self.write();
        let versions = definitions.entry(definition.name.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(EngineError::DuplicateVersion {
                name: definition.name.clone(),
                version: definition.version,
            });
        }
        // Versions only move forward per name
        if let Some(&latest) = versions.keys().next_back() {
            if definition.version < latest {
                return Err(EngineError::Validation(format!(
                    "version {} of '{}' is older than registered version {}",
                    definition.version, definition.name, latest
                )));
            }
        }

        info!(
            "Registered workflow {} ({} steps, category '{}')",
            definition.label(),
            definition.steps.len(),
            definition.category
        );
        versions.insert(definition.version, definition.clone());
        Ok(definition)
    }

    fn get_latest(&self, name: &str) -> Result<WorkflowDefinition> {
        self.read()
            .get(name)
            .and_then(|versions| versions.values().rev().find(|d| d.is_active))
            .cloned()
            .ok_or_else(|| EngineError::not_found("active workflow definition", name))
    }

    fn get_by_name_and_version(&self, name: &str, version: u32) -> Result<WorkflowDefinition> {
        self.read()
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow definition", format!("{}@v{}", name, version)))
    }

    fn list_active(&self, category: Option<&str>) -> Vec<WorkflowDefinition> {
        self.read()
            .values()
            .filter_map(|versions| versions.values().rev().find(|d| d.is_active))
            .filter(|d| category.map_or(true, |c| d.category == c))
            .cloned()
            .collect()
    }

    fn list_versions(&self, name: &str) -> Vec<WorkflowDefinition> {
        self.read()
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn deactivate(&self, name: &str, version: u32) -> Result<()> {
        let mut definitions = self.write();
        let definition = definitions
            .get_mut(name)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| EngineError::not_found("workflow definition", format!("{}@v{}", name, version)))?;

        definition.is_active = false;
        info!("Deactivated workflow {}", definition.label());
        Ok(())
    }

    fn all(&self) -> Vec<WorkflowDefinition> {
        self.read()
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{StepType, WorkflowStepDefinition};

    fn definition(name: &str, version: u32) -> WorkflowDefinition {
        WorkflowDefinition::new(name, version)
            .with_category("staff")
            .with_step(WorkflowStepDefinition::new("validate", 1, StepType::Automatic))
    }

    #[test]
    fn test_register_and_get_exact() {
        let store = InMemoryDefinitionStore::new();
        store.register(definition("onboarding", 1)).unwrap();

        let def = store.get_by_name_and_version("onboarding", 1).unwrap();
        assert_eq!(def.version, 1);
        assert!(store.get_by_name_and_version("onboarding", 2).is_err());
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let store = InMemoryDefinitionStore::new();
        store.register(definition("onboarding", 1)).unwrap();

        let err = store.register(definition("onboarding", 1)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateVersion { version: 1, .. }));
    }

    #[test]
    fn test_latest_is_highest_active() {
        let store = InMemoryDefinitionStore::new();
        store.register(definition("onboarding", 1)).unwrap();
        store.register(definition("onboarding", 2)).unwrap();
        store.register(definition("onboarding", 3)).unwrap();

        assert_eq!(store.get_latest("onboarding").unwrap().version, 3);

        store.deactivate("onboarding", 3).unwrap();
        assert_eq!(store.get_latest("onboarding").unwrap().version, 2);

        // Pinned lookups still see the inactive version
        assert!(!store.get_by_name_and_version("onboarding", 3).unwrap().is_active);
    }

    #[test]
    fn test_versions_are_monotonic() {
        let store = InMemoryDefinitionStore::new();
        store.register(definition("onboarding", 3)).unwrap();

        let err = store.register(definition("onboarding", 1)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(store.get_by_name_and_version("onboarding", 1).is_err());

        // Gaps are fine as long as the version moves forward
        store.register(definition("onboarding", 5)).unwrap();
        assert_eq!(store.get_latest("onboarding").unwrap().version, 5);

        // Other names keep their own sequence
        store.register(definition("offboarding", 1)).unwrap();
    }

    #[test]
    fn test_latest_not_found() {
        let store = InMemoryDefinitionStore::new();
        assert!(matches!(
            store.get_latest("missing"),
            Err(EngineError::NotFound { .. })
        ));

        store.register(definition("retired", 1)).unwrap();
        store.deactivate("retired", 1).unwrap();
        assert!(store.get_latest("retired").is_err());
    }

    #[test]
    fn test_invalid_definition_not_stored() {
        let store = InMemoryDefinitionStore::new();
        let result = store.register(WorkflowDefinition::new("empty", 1));
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_list_active_by_category() {
        let store = InMemoryDefinitionStore::new();
        store.register(definition("onboarding", 1)).unwrap();
        store.register(definition("onboarding", 2)).unwrap();
        store
            .register(
                WorkflowDefinition::new("leave-request", 1)
                    .with_category("hr")
                    .with_step(WorkflowStepDefinition::new("validate", 1, StepType::Automatic)),
            )
            .unwrap();

        let all = store.list_active(None);
        assert_eq!(all.len(), 2);

        let staff = store.list_active(Some("staff"));
        assert_eq!(staff.len(), 1);
        assert_eq!(staff[0].version, 2);

        assert_eq!(store.list_versions("onboarding").len(), 2);
        assert_eq!(store.all().len(), 3);
    }

    #[test]
    fn test_deactivate_unknown() {
        let store = InMemoryDefinitionStore::new();
        assert!(store.deactivate("ghost", 1).is_err());
    }
}
