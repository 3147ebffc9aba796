//! Definition Validation
//!
//! Structural checks applied before a definition is registered:
//! - Required fields are present
//! - Step names are unique
//! - Equal step orders appear only inside an explicit parallel group
//! - Type-specific fields (roles, endpoints, templates, guards) are declared

use std::collections::HashSet;

use log::{debug, info};

use super::model::{StepType, WorkflowDefinition, WorkflowStepDefinition};
use crate::error::{EngineError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyName,
    ZeroVersion,
    NoSteps,
    EmptyStepName,
    DuplicateStepName(String),
    MixedOrderGroup { order: u32, steps: Vec<String> },
    MissingApprovalRoles(String),
    MissingServiceEndpoint(String),
    MissingTemplate(String),
    MissingCondition(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Workflow definition has no name"),
            Self::ZeroVersion => write!(f, "Workflow version must be 1 or greater"),
            Self::NoSteps => write!(f, "Workflow definition has no steps"),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::MixedOrderGroup { order, steps } => write!(
                f,
                "Steps {:?} share stepOrder {} but are not all marked parallel",
                steps, order
            ),
            Self::MissingApprovalRoles(step) => {
                write!(f, "APPROVAL step '{}' declares no approval roles", step)
            }
            Self::MissingServiceEndpoint(step) => {
                write!(f, "SERVICE_CALL step '{}' declares no service endpoint", step)
            }
            Self::MissingTemplate(step) => {
                write!(f, "NOTIFICATION step '{}' declares no notification template", step)
            }
            Self::MissingCondition(step) => {
                write!(f, "CONDITIONAL step '{}' declares no condition expression", step)
            }
        }
    }
}

/// Validates a single step's type-specific fields.
fn validate_step(step: &WorkflowStepDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.step_name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors;
    }

    let name = step.step_name.clone();
    match step.step_type {
        StepType::Approval if step.approval_roles.iter().all(|r| r.trim().is_empty()) => {
            errors.push(ValidationError::MissingApprovalRoles(name));
        }
        StepType::ServiceCall if is_blank(&step.service_endpoint) => {
            errors.push(ValidationError::MissingServiceEndpoint(name));
        }
        StepType::Notification if is_blank(&step.notification_template) => {
            errors.push(ValidationError::MissingTemplate(name));
        }
        StepType::Conditional if is_blank(&step.condition_expression) => {
            errors.push(ValidationError::MissingCondition(name));
        }
        _ => {}
    }

    if !step.is_required {
        debug!("Step '{}' is optional", step.step_name);
    }

    errors
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

/// Collects every rule violation in a definition.
pub fn collect_errors(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }
    if definition.version == 0 {
        errors.push(ValidationError::ZeroVersion);
    }
    if definition.steps.is_empty() {
        errors.push(ValidationError::NoSteps);
        return errors;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !step.step_name.trim().is_empty() && !seen.insert(step.step_name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.step_name.clone()));
        }
        errors.extend(validate_step(step));
    }

    for (order, group) in definition.groups() {
        if group.len() > 1 && !group.iter().all(|s| s.is_parallel) {
            errors.push(ValidationError::MixedOrderGroup {
                order,
                steps: group.iter().map(|s| s.step_name.clone()).collect(),
            });
        }
    }

    errors
}

/// Validates a definition and sorts its steps into execution order.
pub fn validate_definition(definition: &mut WorkflowDefinition) -> Result<()> {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.label(),
        definition.steps.len()
    );

    let errors = collect_errors(definition);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::Validation(messages.join("\n")));
    }

    definition.sort_steps();

    debug!(
        "Step order: {:?}",
        definition
            .steps
            .iter()
            .map(|s| (s.step_order, s.step_name.as_str()))
            .collect::<Vec<_>>()
    );
    Ok(())
}

/// Quick validation that returns a list of error messages.
pub fn quick_validate(definition: &WorkflowDefinition) -> Vec<String> {
    collect_errors(definition)
        .iter()
        .map(|e| e.to_string())
        .collect()
}
