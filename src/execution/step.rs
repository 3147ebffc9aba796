//! Step Dispatcher
//!
//! Performs the type-specific action of one claimed (RUNNING) execution
//! and reports the outcome. The dispatcher never writes to the store and
//! never retries; the engine commits the outcome and the supervisor owns
//! the retry decision.
//!
//! | Step type | Action | Failure |
//! |-----------|--------|---------|
//! | AUTOMATIC | Runs the registered [`StepHandler`](crate::services::StepHandler) under the step timeout | As reported by the handler; missing handler is permanent, deadline is retryable |
//! | APPROVAL | Resolves candidate approvers and a deadline | Identity lookup errors are retryable |
//! | NOTIFICATION | Renders the template into a `message` variable and sends it | Boundary errors are retryable |
//! | SERVICE_CALL | Invokes the endpoint under a timeout | Always retryable |
//! | CONDITIONAL | Evaluated by the engine, never dispatched | Permanent |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{json, Value};

use super::state::{WorkflowExecution, WorkflowInstance};
use crate::clock::Clock;
use crate::error::DispatchError;
use crate::services::{
    HandlerRegistry, HandlerRequest, IdentityService, NotificationService, ServiceInvoker,
};
use crate::workflow::{render_template, DataMap, StepType, WorkflowDefinition, WorkflowStepDefinition};

/// Result of dispatching one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step finished with this output
    Completed(DataMap),
    /// Step action failed
    Failed(DispatchError),
    /// Approval gate opened; completion comes from an explicit decision
    AwaitingApproval {
        assigned_to: Vec<String>,
        timeout_at: Option<DateTime<Utc>>,
    },
}

/// Everything needed to dispatch one execution.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// The claimed execution, with its mapped input
    pub execution: WorkflowExecution,
    pub step: WorkflowStepDefinition,
    pub definition: Arc<WorkflowDefinition>,
    pub instance: WorkflowInstance,
    /// Expression scope at claim time
    pub scope: Value,
}

/// Switches on the step type and calls the matching boundary.
pub struct StepDispatcher {
    identity: Arc<dyn IdentityService>,
    notifications: Arc<dyn NotificationService>,
    invoker: Arc<dyn ServiceInvoker>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    service_timeout: Duration,
}

impl StepDispatcher {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        notifications: Arc<dyn NotificationService>,
        invoker: Arc<dyn ServiceInvoker>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            notifications,
            invoker,
            handlers,
            clock,
            service_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the ceiling on a single SERVICE_CALL invocation.
    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &Arc<dyn IdentityService> {
        &self.identity
    }

    /// Performs the step action.
    pub async fn dispatch(&self, request: &DispatchRequest) -> StepOutcome {
        let step = &request.step;
        debug!(
            "Dispatching {} step '{}' of instance {}",
            step.step_type, step.step_name, request.instance.id
        );

        let outcome = match step.step_type {
            StepType::Automatic => self.run_automatic(request).await,
            StepType::Approval => return self.open_approval(request).await,
            StepType::Notification => self.send_notification(request).await,
            StepType::ServiceCall => self.call_service(request).await,
            StepType::Conditional => Err(DispatchError::permanent(format!(
                "conditional step '{}' is evaluated by the engine",
                step.step_name
            ))),
        };

        match outcome {
            Ok(output) => StepOutcome::Completed(output),
            Err(err) => {
                warn!(
                    "Step '{}' of instance {} failed: {}",
                    step.step_name, request.instance.id, err
                );
                StepOutcome::Failed(err)
            }
        }
    }

    async fn run_automatic(&self, request: &DispatchRequest) -> Result<DataMap, DispatchError> {
        let step = &request.step;
        let handler = self.handlers.resolve(step).ok_or_else(|| {
            DispatchError::permanent(format!(
                "no handler registered for step '{}'{}",
                step.step_name,
                step.service_endpoint
                    .as_deref()
                    .map(|e| format!(" (endpoint '{}')", e))
                    .unwrap_or_default()
            ))
        })?;

        let deadline = self.automatic_deadline(request);
        let run = handler.execute(HandlerRequest {
            step_name: &step.step_name,
            instance: Some(&request.instance),
            input: &request.execution.input_data,
        });
        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::retryable(format!(
                "handler for '{}' timed out after {:?}",
                step.step_name, deadline
            ))),
        }
    }

    /// The step's effective timeout, or the service ceiling when none is set.
    fn automatic_deadline(&self, request: &DispatchRequest) -> Duration {
        request
            .step
            .effective_timeout_minutes(&request.definition)
            .map_or(self.service_timeout, |minutes| {
                Duration::from_secs(u64::from(minutes) * 60)
            })
    }

    async fn open_approval(&self, request: &DispatchRequest) -> StepOutcome {
        let step = &request.step;
        let assigned_to = match self.identity.resolve_role_holders(&step.approval_roles).await {
            Ok(users) => users,
            Err(err) => return StepOutcome::Failed(DispatchError::retryable(err.message)),
        };
        if assigned_to.is_empty() {
            warn!(
                "No users hold roles {:?} for approval step '{}'",
                step.approval_roles, step.step_name
            );
        }

        let timeout_at = step
            .effective_timeout_minutes(&request.definition)
            .map(|minutes| self.clock.now() + chrono::Duration::minutes(i64::from(minutes)));

        StepOutcome::AwaitingApproval {
            assigned_to,
            timeout_at,
        }
    }

    async fn send_notification(&self, request: &DispatchRequest) -> Result<DataMap, DispatchError> {
        let step = &request.step;
        let input = &request.execution.input_data;
        let template = step
            .notification_template
            .as_deref()
            .ok_or_else(|| DispatchError::permanent("notification step has no template"))?;

        let recipient = match input.get("recipient") {
            Some(Value::String(r)) if !r.is_empty() => r.clone(),
            _ => request
                .instance
                .started_by
                .clone()
                .ok_or_else(|| DispatchError::permanent("notification has no recipient"))?,
        };

        let rendered = render_template(template, &request.scope);
        let mut variables = input.clone();
        variables.insert("message".to_string(), json!(rendered));
        self.notifications
            .send_templated(&recipient, template, &variables)
            .await
            .map_err(|err| DispatchError::retryable(err.message))?;

        let mut output = DataMap::new();
        output.insert("recipient".to_string(), json!(recipient));
        output.insert("message".to_string(), json!(rendered));
        output.insert("sentAt".to_string(), json!(self.clock.now()));
        Ok(output)
    }

    async fn call_service(&self, request: &DispatchRequest) -> Result<DataMap, DispatchError> {
        let endpoint = request
            .step
            .service_endpoint
            .as_deref()
            .ok_or_else(|| DispatchError::permanent("service call step has no endpoint"))?;

        let call = self.invoker.invoke(endpoint, &request.execution.input_data);
        match tokio::time::timeout(self.service_timeout, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(DispatchError::retryable(err.message)),
            Err(_) => Err(DispatchError::retryable(format!(
                "call to '{}' timed out after {:?}",
                endpoint, self.service_timeout
            ))),
        }
    }
}
