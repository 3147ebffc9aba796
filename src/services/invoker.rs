//! Service Invocation and Step Handlers
//!
//! AUTOMATIC steps run in-process [`StepHandler`]s looked up in a
//! [`HandlerRegistry`] by the step's `serviceEndpoint`, falling back to
//! its `stepName`. SERVICE_CALL steps go through a [`ServiceInvoker`].
//!
//! # Built-in handlers
//!
//! | Key | Behavior |
//! |-----|----------|
//! | `noop` | Returns its input unchanged |
//! | `identity:update-approval-status` | Writes the entity's approval status through the identity boundary |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use super::identity::{ApprovalStatusUpdate, IdentityService};
use crate::error::DispatchError;
use crate::execution::state::WorkflowInstance;
use crate::workflow::{DataMap, WorkflowStepDefinition};

pub const NOOP_HANDLER: &str = "noop";
pub const APPROVAL_STATUS_HANDLER: &str = "identity:update-approval-status";

/// Generic downstream service call.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(&self, endpoint: &str, input: &DataMap) -> Result<DataMap, DispatchError>;
}

/// What a handler gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRequest<'a> {
    pub step_name: &'a str,
    /// Owning instance; absent when called through a [`ServiceInvoker`]
    pub instance: Option<&'a WorkflowInstance>,
    pub input: &'a DataMap,
}

/// Pluggable in-process logic for AUTOMATIC steps.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, request: HandlerRequest<'_>) -> Result<DataMap, DispatchError>;
}

/// Handlers keyed by endpoint or step name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in handlers.
    pub fn with_builtins(identity: Arc<dyn IdentityService>) -> Self {
        let mut registry = Self::new();
        registry.register(NOOP_HANDLER, Arc::new(NoopHandler));
        registry.register(APPROVAL_STATUS_HANDLER, Arc::new(ApprovalStatusHandler::new(identity)));
        registry
    }

    /// Registers a handler, replacing any previous one under `key`.
    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let key = key.into();
        debug!("Registered step handler '{}'", key);
        self.handlers.insert(key, handler);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(key).cloned()
    }

    /// Handler for a step: endpoint first, then step name.
    pub fn resolve(&self, step: &WorkflowStepDefinition) -> Option<Arc<dyn StepHandler>> {
        step.service_endpoint
            .as_deref()
            .and_then(|endpoint| self.get(endpoint))
            .or_else(|| self.get(&step.step_name))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Echoes its input.
pub struct NoopHandler;

#[async_trait]
impl StepHandler for NoopHandler {
    async fn execute(&self, request: HandlerRequest<'_>) -> Result<DataMap, DispatchError> {
        Ok(request.input.clone())
    }
}

/// Finalizes a business approval on the instance's entity.
///
/// Reads `status` (default `APPROVED`), `approvedBy` and `notes` from the
/// step input. Without an owning instance the entity comes from the
/// `entityType` and `entityId` inputs.
pub struct ApprovalStatusHandler {
    identity: Arc<dyn IdentityService>,
}

impl ApprovalStatusHandler {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }
}

fn input_str(input: &DataMap, key: &str) -> Option<String> {
    match input.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl StepHandler for ApprovalStatusHandler {
    async fn execute(&self, request: HandlerRequest<'_>) -> Result<DataMap, DispatchError> {
        let (entity_type, entity_id) = match request.instance {
            Some(instance) => (instance.entity_type.clone(), instance.entity_id.clone()),
            None => (
                input_str(request.input, "entityType")
                    .ok_or_else(|| DispatchError::permanent("missing input 'entityType'"))?,
                input_str(request.input, "entityId")
                    .ok_or_else(|| DispatchError::permanent("missing input 'entityId'"))?,
            ),
        };

        let update = ApprovalStatusUpdate {
            entity_type,
            entity_id,
            status: input_str(request.input, "status").unwrap_or_else(|| "APPROVED".to_string()),
            approver_id: input_str(request.input, "approvedBy"),
            notes: input_str(request.input, "notes"),
        };
        self.identity.update_entity_approval_status(update.clone()).await?;

        let mut output = DataMap::new();
        output.insert("approvalStatus".to_string(), json!(update.status));
        output.insert("entityType".to_string(), json!(update.entity_type));
        output.insert("entityId".to_string(), json!(update.entity_id));
        Ok(output)
    }
}

/// [`ServiceInvoker`] that routes endpoints to registered handlers.
pub struct HandlerServiceInvoker {
    registry: HandlerRegistry,
}

impl HandlerServiceInvoker {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ServiceInvoker for HandlerServiceInvoker {
    async fn invoke(&self, endpoint: &str, input: &DataMap) -> Result<DataMap, DispatchError> {
        let handler = self
            .registry
            .get(endpoint)
            .ok_or_else(|| DispatchError::retryable(format!("no service registered at '{}'", endpoint)))?;

        handler
            .execute(HandlerRequest {
                step_name: endpoint,
                instance: None,
                input,
            })
            .await
    }
}
