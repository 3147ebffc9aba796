//! Instance Store
//!
//! Persists workflow instances and their step executions. Writes are
//! compare-and-swap on `row_version`: an update carrying a stale token is
//! rejected with [`EngineError::Conflict`] and the caller reloads.
//!
//! The store also owns two insert-time guarantees:
//! - a business key identifies at most one non-terminal instance
//! - an instance has at most one execution row per step

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use uuid::Uuid;

use super::state::{ExecutionStatus, InstanceStatus, WorkflowExecution, WorkflowInstance};
use crate::error::{EngineError, Result};

/// Persistence for instances and executions.
pub trait InstanceStore: Send + Sync {
    /// Stores a new instance, rejecting a live duplicate business key.
    fn insert_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance>;

    /// Compare-and-swap write; returns the stored row with its new version.
    fn update_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    /// Instances, optionally filtered by status, oldest first.
    fn list_instances(&self, status: Option<InstanceStatus>) -> Vec<WorkflowInstance>;

    /// The non-terminal instance holding `business_key`, if any.
    fn find_active_by_business_key(&self, business_key: &str) -> Option<WorkflowInstance>;

    /// Stores a new execution, rejecting a second row for the same step.
    fn insert_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution>;

    fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution>;

    /// Compare-and-swap write; returns the stored row with its new version.
    fn update_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution>;

    /// Executions of one instance ordered by step order, then name.
    fn executions_for_instance(&self, instance_id: Uuid) -> Vec<WorkflowExecution>;

    /// Executions across all instances in the given status.
    fn executions_by_status(&self, status: ExecutionStatus) -> Vec<WorkflowExecution>;

    /// Every stored execution, for snapshots.
    fn all_executions(&self) -> Vec<WorkflowExecution>;
}

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<Uuid, WorkflowInstance>,
    executions: HashMap<Uuid, WorkflowExecution>,
    /// (instance, step name) -> execution id
    step_index: HashMap<(Uuid, String), Uuid>,
}

/// In-memory [`InstanceStore`].
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    tables: RwLock<Tables>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from previously saved rows.
    pub fn from_records(
        instances: Vec<WorkflowInstance>,
        executions: Vec<WorkflowExecution>,
    ) -> Self {
        let mut tables = Tables::default();
        for instance in instances {
            tables.instances.insert(instance.id, instance);
        }
        for execution in executions {
            tables
                .step_index
                .insert((execution.instance_id, execution.step_name.clone()), execution.id);
            tables.executions.insert(execution.id, execution);
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn sort_executions(executions: &mut [WorkflowExecution]) {
    executions.sort_by(|a, b| {
        a.step_order
            .cmp(&b.step_order)
            .then_with(|| a.step_name.cmp(&b.step_name))
    });
}

impl InstanceStore for InMemoryInstanceStore {
    fn insert_instance(&self, mut instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let mut tables = self.write();

        if let Some(key) = instance.business_key.as_deref() {
            let taken = tables
                .instances
                .values()
                .any(|other| !other.is_terminal() && other.business_key.as_deref() == Some(key));
            if taken {
                return Err(EngineError::DuplicateInstance(key.to_string()));
            }
        }
        if tables.instances.contains_key(&instance.id) {
            return Err(EngineError::Conflict {
                kind: "instance",
                id: instance.id,
            });
        }

        instance.row_version = 1;
        tables.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.read()
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow instance", id))
    }

    fn update_instance(&self, mut instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let mut tables = self.write();
        let stored = tables
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| EngineError::not_found("workflow instance", instance.id))?;

        if stored.row_version != instance.row_version {
            debug!(
                "Stale write to instance {} (have v{}, stored v{})",
                instance.id, instance.row_version, stored.row_version
            );
            return Err(EngineError::Conflict {
                kind: "instance",
                id: instance.id,
            });
        }

        instance.row_version += 1;
        *stored = instance.clone();
        Ok(instance)
    }

    fn list_instances(&self, status: Option<InstanceStatus>) -> Vec<WorkflowInstance> {
        let mut instances: Vec<_> = self
            .read()
            .instances
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    fn find_active_by_business_key(&self, business_key: &str) -> Option<WorkflowInstance> {
        self.read()
            .instances
            .values()
            .find(|i| !i.is_terminal() && i.business_key.as_deref() == Some(business_key))
            .cloned()
    }

    fn insert_execution(&self, mut execution: WorkflowExecution) -> Result<WorkflowExecution> {
        let mut tables = self.write();
        if !tables.instances.contains_key(&execution.instance_id) {
            return Err(EngineError::not_found("workflow instance", execution.instance_id));
        }

        let key = (execution.instance_id, execution.step_name.clone());
        if tables.step_index.contains_key(&key) {
            // Another advancer materialized this step first
            return Err(EngineError::Conflict {
                kind: "execution",
                id: execution.instance_id,
            });
        }

        execution.row_version = 1;
        tables.step_index.insert(key, execution.id);
        tables.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution> {
        self.read()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow execution", id))
    }

    fn update_execution(&self, mut execution: WorkflowExecution) -> Result<WorkflowExecution> {
        let mut tables = self.write();
        let stored = tables
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| EngineError::not_found("workflow execution", execution.id))?;

        if stored.row_version != execution.row_version {
            debug!(
                "Stale write to execution {} '{}' (have v{}, stored v{})",
                execution.id, execution.step_name, execution.row_version, stored.row_version
            );
            return Err(EngineError::Conflict {
                kind: "execution",
                id: execution.id,
            });
        }

        execution.row_version += 1;
        *stored = execution.clone();
        Ok(execution)
    }

    fn executions_for_instance(&self, instance_id: Uuid) -> Vec<WorkflowExecution> {
        let mut executions: Vec<_> = self
            .read()
            .executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect();
        sort_executions(&mut executions);
        executions
    }

    fn executions_by_status(&self, status: ExecutionStatus) -> Vec<WorkflowExecution> {
        let mut executions: Vec<_> = self
            .read()
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        executions
    }

    fn all_executions(&self) -> Vec<WorkflowExecution> {
        self.read().executions.values().cloned().collect()
    }
}
