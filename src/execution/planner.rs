//! Step Planner
//!
//! Decides what an instance should do next by walking the definition's
//! order groups from lowest to highest against the executions recorded
//! so far:
//! - missing steps in the first unfinished group are materialized
//! - a group with any unsettled execution makes the instance wait
//! - a settled group with an exhausted required failure fails the instance
//! - once every group is settled the instance completes
//!
//! Parallel peers always finish before a failure is acted on.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::state::{ExecutionStatus, WorkflowExecution, WorkflowInstance};
use crate::workflow::{DataMap, WorkflowDefinition, WorkflowStepDefinition};

/// Next action for an instance.
#[derive(Debug, PartialEq)]
pub enum Plan<'a> {
    /// Create executions for these steps, all sharing one order
    Materialize(Vec<&'a WorkflowStepDefinition>),
    /// Work is in flight or parked; nothing to do until it settles
    Wait { order: u32, steps: Vec<String> },
    /// A required step failed for good
    Fail { step_name: String, message: String },
    /// Every step is settled and nothing required failed
    Complete,
}

/// Computes the next action from the definition and current executions.
pub fn plan_next<'a>(definition: &'a WorkflowDefinition, executions: &[WorkflowExecution]) -> Plan<'a> {
    let by_step: HashMap<&str, &WorkflowExecution> = executions
        .iter()
        .map(|e| (e.step_name.as_str(), e))
        .collect();

    for (order, steps) in definition.groups() {
        let missing: Vec<_> = steps
            .iter()
            .copied()
            .filter(|s| !by_step.contains_key(s.step_name.as_str()))
            .collect();
        if !missing.is_empty() {
            return Plan::Materialize(missing);
        }

        let mut unsettled = Vec::new();
        let mut failure = None;
        for step in &steps {
            let Some(execution) = by_step.get(step.step_name.as_str()) else {
                continue;
            };
            if !execution.is_settled(step.effective_retry_bound(definition)) {
                unsettled.push(step.step_name.clone());
            } else if execution.status == ExecutionStatus::Failed && step.is_required && failure.is_none() {
                failure = Some(*execution);
            }
        }

        if !unsettled.is_empty() {
            return Plan::Wait {
                order,
                steps: unsettled,
            };
        }
        if let Some(execution) = failure {
            return Plan::Fail {
                step_name: execution.step_name.clone(),
                message: execution
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string()),
            };
        }
    }

    Plan::Complete
}

/// Builds the expression scope for guards, mappings and templates.
pub fn build_scope(instance: &WorkflowInstance, executions: &[WorkflowExecution]) -> Value {
    let steps: serde_json::Map<String, Value> = executions
        .iter()
        .map(|e| {
            (
                e.step_name.clone(),
                json!({ "output": e.output_data, "status": e.status }),
            )
        })
        .collect();

    json!({
        "context": instance.context_data,
        "input": instance.input_data,
        "steps": steps,
        "instance": {
            "entityType": instance.entity_type,
            "entityId": instance.entity_id,
            "businessKey": instance.business_key,
            "priority": instance.priority,
        }
    })
}

/// Output of the last completed step that produced any data.
pub fn final_output(executions: &[WorkflowExecution]) -> DataMap {
    executions
        .iter()
        .rev()
        .find(|e| e.status == ExecutionStatus::Completed && !e.output_data.is_empty())
        .map(|e| e.output_data.clone())
        .unwrap_or_default()
}
