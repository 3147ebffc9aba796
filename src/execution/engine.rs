//! Workflow Execution Engine
//!
//! The control loop that drives instances from start to a terminal state:
//! - Resolves and pins definitions at start, guarding business keys
//! - Materializes eligible steps, evaluating guards and skipping falsy ones
//! - Dispatches pending executions concurrently, bounded by a semaphore
//! - Commits outcomes under compare-and-swap, dropping stale ones
//! - Completes, fails or cancels instances
//!
//! Every store write is optimistic. Conflicts are retried internally up to
//! `max_conflict_retries` times and never surface to callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use uuid::Uuid;

use super::planner::{build_scope, final_output, plan_next, Plan};
use super::state::{
    ExecutionStatus, InstanceStatus, Snapshot, WorkflowExecution, WorkflowInstance,
};
use super::step::{DispatchRequest, StepDispatcher, StepOutcome};
use super::store::InstanceStore;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::monitoring::{EventType, ExecutionTimeline, INSTANCE_SUBJECT};
use crate::workflow::{
    ConditionEvaluator, DataMap, DefinitionStore, StepType, WorkflowDefinition,
    WorkflowStepDefinition,
};

/// Parameters for starting an instance.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub workflow_name: String,
    /// Exact version to pin; latest active when absent
    pub version: Option<u32>,
    pub business_key: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub instance_name: Option<String>,
    pub priority: Option<i32>,
    pub input_data: DataMap,
    pub context_data: DataMap,
    /// Overrides the definition's `autoStart`
    pub auto_start: Option<bool>,
    pub started_by: Option<String>,
}

impl StartRequest {
    pub fn new(
        workflow_name: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_input(mut self, input: DataMap) -> Self {
        self.input_data = input;
        self
    }

    pub fn with_context(mut self, context: DataMap) -> Self {
        self.context_data = context;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = Some(auto_start);
        self
    }

    pub fn started_by(mut self, user: impl Into<String>) -> Self {
        self.started_by = Some(user.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// An instance together with its executions, ordered by step order.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceView {
    pub instance: WorkflowInstance,
    pub executions: Vec<WorkflowExecution>,
}

impl InstanceView {
    /// The execution for a step, if it was ever materialized.
    pub fn execution(&self, step_name: &str) -> Option<&WorkflowExecution> {
        self.executions.iter().find(|e| e.step_name == step_name)
    }
}

/// Workflow execution engine.
///
/// Cheap to clone; clones share stores, dispatcher and timelines.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowgate::prelude::*;
///
/// # async fn run() -> flowgate::Result<()> {
/// let clock = Arc::new(SystemClock);
/// let identity = Arc::new(StaticIdentityService::new().with_user("alice", ["CLINIC_ADMIN"]));
/// let handlers = HandlerRegistry::with_builtins(identity.clone());
/// let dispatcher = StepDispatcher::new(
///     identity,
///     Arc::new(LogNotificationService::new()),
///     Arc::new(HandlerServiceInvoker::new(handlers.clone())),
///     handlers,
///     clock.clone(),
/// );
/// let engine = Engine::new(
///     EngineConfig::default(),
///     Arc::new(InMemoryDefinitionStore::new()),
///     Arc::new(InMemoryInstanceStore::new()),
///     dispatcher,
///     clock,
/// );
///
/// let view = engine
///     .start(StartRequest::new("staff-onboarding", "Staff", "42").with_business_key("staff-42"))
///     .await?;
/// println!("{} is {}", view.instance.id, view.instance.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    definitions: Arc<dyn DefinitionStore>,
    store: Arc<dyn InstanceStore>,
    dispatcher: Arc<StepDispatcher>,
    clock: Arc<dyn Clock>,
    dispatch_slots: Arc<Semaphore>,
    /// Live dispatch tasks keyed by (execution, claimed row version)
    in_flight: Arc<Mutex<HashMap<(Uuid, u64), AbortHandle>>>,
    timelines: Arc<Mutex<HashMap<Uuid, ExecutionTimeline>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        definitions: Arc<dyn DefinitionStore>,
        store: Arc<dyn InstanceStore>,
        dispatcher: StepDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = dispatcher.with_service_timeout(config.service_call_timeout());
        let dispatch_slots = Arc::new(Semaphore::new(config.max_parallel_dispatch.max(1)));
        Self {
            config,
            definitions,
            store,
            dispatcher: Arc::new(dispatcher),
            clock,
            dispatch_slots,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            timelines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Validates and stores a definition version.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        self.definitions.register(definition)
    }

    /// Latest active version of each workflow, optionally by category.
    pub fn list_definitions(&self, category: Option<&str>) -> Vec<WorkflowDefinition> {
        self.definitions.list_active(category)
    }

    // ------------------------------------------------------------------
    // Instance lifecycle
    // ------------------------------------------------------------------

    /// Starts an instance of a workflow against a business entity.
    ///
    /// With auto-start the instance moves to RUNNING and is advanced until
    /// it completes, fails or parks on an approval or a retryable failure.
    pub async fn start(&self, request: StartRequest) -> Result<InstanceView> {
        if request.entity_type.trim().is_empty() || request.entity_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "entity type and entity id are required".to_string(),
            ));
        }
        if matches!(request.business_key.as_deref(), Some(key) if key.trim().is_empty()) {
            return Err(EngineError::Validation("business key must not be blank".to_string()));
        }

        let definition = match request.version {
            Some(version) => {
                let definition = self
                    .definitions
                    .get_by_name_and_version(&request.workflow_name, version)?;
                if !definition.is_active {
                    return Err(EngineError::Validation(format!(
                        "workflow {} is inactive",
                        definition.label()
                    )));
                }
                definition
            }
            None => self.definitions.get_latest(&request.workflow_name)?,
        };

        // The insert re-checks atomically; this only fails fast
        if let Some(key) = request.business_key.as_deref() {
            if let Some(holder) = self.store.find_active_by_business_key(key) {
                debug!("Business key '{}' is held by instance {}", key, holder.id);
                return Err(EngineError::DuplicateInstance(key.to_string()));
            }
        }

        let now = self.clock.now();
        let mut instance =
            WorkflowInstance::new(&definition, request.entity_type, request.entity_id, now);
        if let Some(name) = request.instance_name {
            instance.instance_name = name;
        }
        instance.business_key = request.business_key;
        instance.priority = request.priority.unwrap_or(self.config.default_priority);
        instance.input_data = request.input_data;
        instance.context_data = request.context_data;
        instance.started_by = request.started_by;
        instance.timeout_at = definition
            .timeout_minutes
            .map(|minutes| now + Duration::minutes(i64::from(minutes)));

        let instance = self.store.insert_instance(instance)?;
        info!(
            "Created instance {} of {} for {} {}",
            instance.id,
            definition.label(),
            instance.entity_type,
            instance.entity_id
        );
        self.record(instance.id, INSTANCE_SUBJECT, EventType::Created, None);

        if request.auto_start.unwrap_or(definition.auto_start) {
            self.retry_on_conflict(|| self.begin(instance.id))?;
            self.advance(instance.id).await?;
        }

        self.get_instance(instance.id)
    }

    /// Instance with its executions.
    pub fn get_instance(&self, id: Uuid) -> Result<InstanceView> {
        let instance = self.store.get_instance(id)?;
        let executions = self.store.executions_for_instance(id);
        Ok(InstanceView {
            instance,
            executions,
        })
    }

    pub fn list_instances(&self, status: Option<InstanceStatus>) -> Vec<WorkflowInstance> {
        self.store.list_instances(status)
    }

    /// Re-drives an instance: moves it to RUNNING if CREATED or WAITING,
    /// then dispatches any PENDING work and plans onward. Terminal
    /// instances are left alone.
    pub async fn resume(&self, id: Uuid) -> Result<InstanceView> {
        let instance = self.store.get_instance(id)?;
        if !instance.is_terminal() {
            self.retry_on_conflict(|| self.begin(id))?;
            self.advance(id).await?;
        }
        self.get_instance(id)
    }

    /// Cancels a non-terminal instance and skips its unfinished executions.
    ///
    /// In-flight dispatches are not interrupted; their outcomes are dropped
    /// at commit time.
    pub fn cancel(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance> {
        let note = format!("cancelled: {}", reason);
        let instance = self.retry_on_conflict(|| {
            let mut instance = self.store.get_instance(id)?;
            if instance.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "instance {} is already {}",
                    id, instance.status
                )));
            }
            instance.transition(InstanceStatus::Cancelled, self.clock.now())?;
            instance.error_message = Some(note.clone());
            self.store.update_instance(instance)
        })?;

        info!("Cancelled instance {}: {}", id, reason);
        self.record(id, INSTANCE_SUBJECT, EventType::Cancelled, Some(reason.to_string()));
        self.skip_active_executions(id, &note)?;
        Ok(instance)
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    /// Records a human decision on a WAITING_APPROVAL execution.
    ///
    /// Approval completes the step; rejection fails a required step (and
    /// with it the instance) or skips an optional one. A WAITING instance
    /// goes back to RUNNING and is advanced afterwards.
    pub async fn resolve_approval(
        &self,
        execution_id: Uuid,
        approver: &str,
        approved: bool,
        notes: Option<&str>,
    ) -> Result<WorkflowExecution> {
        let execution = self.store.get_execution(execution_id)?;
        if execution.status != ExecutionStatus::WaitingApproval {
            return Err(EngineError::NotWaiting(execution_id));
        }

        let instance = self.store.get_instance(execution.instance_id)?;
        let definition = self.load_definition(&instance)?;
        let step = step_of(&definition, &execution.step_name)?.clone();

        let roles = self.dispatcher.identity().user_roles(approver).await?;
        if !roles.iter().any(|role| step.approval_roles.contains(role)) {
            return Err(EngineError::Unauthorized {
                user: approver.to_string(),
                reason: format!(
                    "step '{}' requires one of {:?}",
                    step.step_name, step.approval_roles
                ),
            });
        }

        let decided = self.retry_on_conflict(|| {
            self.record_decision(execution_id, &step, approver, approved, notes)
        })?;

        if decided.status == ExecutionStatus::Completed {
            self.merge_step_output(&decided, &step)?;
        }
        self.retry_on_conflict(|| self.begin(instance.id))?;
        self.advance(instance.id).await?;

        self.store.get_execution(execution_id)
    }

    /// WAITING_APPROVAL executions a user can decide on, either because
    /// they were assigned or because they hold one of the step's roles.
    pub async fn pending_approvals_for_user(&self, user: &str) -> Result<Vec<WorkflowExecution>> {
        let roles = self.dispatcher.identity().user_roles(user).await?;
        Ok(self.pending_approvals(|execution, step| {
            execution.assigned_to.iter().any(|u| u == user)
                || step.approval_roles.iter().any(|r| roles.contains(r))
        }))
    }

    /// WAITING_APPROVAL executions whose step accepts `role`.
    pub fn pending_approvals_for_role(&self, role: &str) -> Vec<WorkflowExecution> {
        self.pending_approvals(|_, step| step.approval_roles.iter().any(|r| r == role))
    }

    fn pending_approvals<F>(&self, accept: F) -> Vec<WorkflowExecution>
    where
        F: Fn(&WorkflowExecution, &WorkflowStepDefinition) -> bool,
    {
        self.store
            .executions_by_status(ExecutionStatus::WaitingApproval)
            .into_iter()
            .filter(|execution| {
                let Ok(instance) = self.store.get_instance(execution.instance_id) else {
                    return false;
                };
                let Ok(definition) = self.load_definition(&instance) else {
                    return false;
                };
                definition
                    .step(&execution.step_name)
                    .map_or(false, |step| accept(execution, step))
            })
            .collect()
    }

    fn record_decision(
        &self,
        execution_id: Uuid,
        step: &WorkflowStepDefinition,
        approver: &str,
        approved: bool,
        notes: Option<&str>,
    ) -> Result<WorkflowExecution> {
        let mut execution = self.store.get_execution(execution_id)?;
        if execution.status != ExecutionStatus::WaitingApproval {
            return Err(EngineError::NotWaiting(execution_id));
        }

        let now = self.clock.now();
        execution.approved_by = Some(approver.to_string());
        execution.approval_notes = notes.map(String::from);
        execution.output_data = json!({
            "approved": approved,
            "approvedBy": approver,
            "notes": notes,
        })
        .as_object()
        .cloned()
        .unwrap_or_default();

        let event = if approved {
            execution.transition(ExecutionStatus::Completed, now)?;
            EventType::Completed
        } else {
            let message = match notes {
                Some(notes) => format!("rejected by {}: {}", approver, notes),
                None => format!("rejected by {}", approver),
            };
            if step.is_required {
                execution.fail(message, false, now)?;
                EventType::Failed
            } else {
                execution.transition(ExecutionStatus::Skipped, now)?;
                execution.error_message = Some(message);
                EventType::Skipped
            }
        };

        let execution = self.store.update_execution(execution)?;
        info!(
            "Step '{}' of instance {} {} by {}",
            execution.step_name,
            execution.instance_id,
            if approved { "approved" } else { "rejected" },
            approver
        );
        self.record(
            execution.instance_id,
            &execution.step_name,
            event,
            execution.error_message.clone(),
        );
        Ok(execution)
    }

    // ------------------------------------------------------------------
    // Monitoring and persistence
    // ------------------------------------------------------------------

    /// Transition timeline of an instance.
    pub fn timeline(&self, id: Uuid) -> Result<ExecutionTimeline> {
        let recorded = self.lock_timelines().get(&id).cloned();
        match recorded {
            Some(timeline) => Ok(timeline),
            None => {
                let view = self.get_instance(id)?;
                Ok(ExecutionTimeline::from_records(&view.instance, &view.executions))
            }
        }
    }

    /// Copy of every stored definition, instance and execution.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            definitions: self.definitions.all(),
            instances: self.store.list_instances(None),
            executions: self.store.all_executions(),
            saved_at: self.clock.now(),
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<(Uuid, u64), AbortHandle>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timelines(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ExecutionTimeline>> {
        self.timelines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record(&self, id: Uuid, subject: &str, event: EventType, detail: Option<String>) {
        let now = self.clock.now();
        self.lock_timelines()
            .entry(id)
            .or_insert_with(|| ExecutionTimeline::new(id))
            .add_event(subject, event, now, detail);
    }

    // ------------------------------------------------------------------
    // Advance loop
    // ------------------------------------------------------------------

    /// Plans, materializes and dispatches until the instance terminates
    /// or has nothing runnable left.
    pub(crate) async fn advance(&self, id: Uuid) -> Result<()> {
        loop {
            let pending = self.retry_on_conflict(|| self.plan_step(id))?;
            if pending.is_empty() {
                return Ok(());
            }
            // Every claim moves its row out of PENDING, so this terminates
            self.dispatch_batch(pending).await?;
        }
    }

    /// Moves a CREATED or WAITING instance to RUNNING.
    fn begin(&self, id: Uuid) -> Result<()> {
        let mut instance = self.store.get_instance(id)?;
        if !matches!(instance.status, InstanceStatus::Created | InstanceStatus::Waiting) {
            return Ok(());
        }
        let now = self.clock.now();
        instance.transition(InstanceStatus::Running, now)?;
        instance.started_at.get_or_insert(now);
        self.store.update_instance(instance)?;

        info!("Running instance {}", id);
        self.record(id, INSTANCE_SUBJECT, EventType::Started, None);
        Ok(())
    }

    /// Applies planner decisions until there is PENDING work to dispatch
    /// or nothing left to do.
    fn plan_step(&self, id: Uuid) -> Result<Vec<WorkflowExecution>> {
        loop {
            let instance = self.store.get_instance(id)?;
            if instance.status != InstanceStatus::Running {
                return Ok(Vec::new());
            }

            let definition = self.load_definition(&instance)?;
            let executions = self.store.executions_for_instance(id);

            let pending: Vec<_> = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Pending)
                .cloned()
                .collect();
            if !pending.is_empty() {
                return Ok(pending);
            }

            match plan_next(&definition, &executions) {
                Plan::Materialize(steps) => {
                    self.materialize(instance, &executions, &steps)?;
                }
                Plan::Wait { order, steps } => {
                    self.track_current(instance, order, steps.join(", "))?;
                    return Ok(Vec::new());
                }
                Plan::Fail { step_name, message } => {
                    let message = format!("step '{}' failed: {}", step_name, message);
                    self.finish(instance, InstanceStatus::Failed, Some(message), &executions)?;
                    return Ok(Vec::new());
                }
                Plan::Complete => {
                    self.finish(instance, InstanceStatus::Completed, None, &executions)?;
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Creates executions for one order group.
    ///
    /// Guards are evaluated here: a falsy guard inserts the row as SKIPPED,
    /// a truthy CONDITIONAL step is completed in place, and a guard that
    /// cannot be evaluated fails the step for good.
    fn materialize(
        &self,
        instance: WorkflowInstance,
        executions: &[WorkflowExecution],
        steps: &[&WorkflowStepDefinition],
    ) -> Result<()> {
        let evaluator = ConditionEvaluator::new();
        let scope = build_scope(&instance, executions);
        let now = self.clock.now();

        for step in steps {
            let mut execution = WorkflowExecution::new(instance.id, step, now);
            let guard = step
                .condition_expression
                .as_deref()
                .map(|expr| evaluator.evaluate_bool(expr, &scope));

            let event = match guard {
                Some(Ok(false)) => {
                    execution.transition(ExecutionStatus::Skipped, now)?;
                    info!("Skipping step '{}' of instance {}: guard is false", step.step_name, instance.id);
                    EventType::Skipped
                }
                Some(Err(err)) => {
                    execution.transition(ExecutionStatus::Running, now)?;
                    execution.started_at = Some(now);
                    execution.fail(err.to_string(), false, now)?;
                    warn!("Step '{}' of instance {}: {}", step.step_name, instance.id, err);
                    EventType::Failed
                }
                Some(Ok(true)) if step.step_type == StepType::Conditional => {
                    execution.transition(ExecutionStatus::Running, now)?;
                    execution.started_at = Some(now);
                    execution.output_data.insert("result".to_string(), json!(true));
                    execution.transition(ExecutionStatus::Completed, now)?;
                    EventType::Completed
                }
                _ => EventType::Created,
            };

            let execution = self.store.insert_execution(execution)?;
            debug!(
                "Materialized step '{}' of instance {} as {}",
                execution.step_name, instance.id, execution.status
            );
            self.record(instance.id, &execution.step_name, event, execution.error_message.clone());
        }

        if let Some(first) = steps.first() {
            let names: Vec<_> = steps.iter().map(|s| s.step_name.as_str()).collect();
            self.track_current(instance, first.step_order, names.join(", "))?;
        }
        Ok(())
    }

    /// Keeps `currentStepOrder`/`currentStepName` pointing at live work.
    fn track_current(&self, mut instance: WorkflowInstance, order: u32, names: String) -> Result<()> {
        if instance.current_step_order == Some(order)
            && instance.current_step_name.as_deref() == Some(names.as_str())
        {
            return Ok(());
        }
        instance.current_step_order = Some(order);
        instance.current_step_name = Some(names);
        instance.updated_at = self.clock.now();
        self.store.update_instance(instance)?;
        Ok(())
    }

    fn finish(
        &self,
        mut instance: WorkflowInstance,
        status: InstanceStatus,
        error_message: Option<String>,
        executions: &[WorkflowExecution],
    ) -> Result<()> {
        instance.transition(status, self.clock.now())?;
        if status == InstanceStatus::Completed {
            instance.output_data = final_output(executions);
        }
        instance.error_message = error_message.clone();

        let instance = self.store.update_instance(instance)?;
        match &error_message {
            Some(message) => warn!("Instance {} {}: {}", instance.id, status, message),
            None => info!("Instance {} {}", instance.id, status),
        }
        let event = if status == InstanceStatus::Completed {
            EventType::Completed
        } else {
            EventType::Failed
        };
        self.record(instance.id, INSTANCE_SUBJECT, event, error_message);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch and commit
    // ------------------------------------------------------------------

    /// Claims and dispatches pending executions concurrently, committing
    /// each outcome as it arrives.
    async fn dispatch_batch(&self, pending: Vec<WorkflowExecution>) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut claimed = 0;

        for execution in pending {
            let Some(request) = self.retry_on_conflict(|| self.claim(execution.id))? else {
                continue;
            };
            claimed += 1;

            let key = (request.execution.id, request.execution.row_version);
            let dispatcher = Arc::clone(&self.dispatcher);
            let slots = Arc::clone(&self.dispatch_slots);
            let handle = tasks.spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                let outcome = dispatcher.dispatch(&request).await;
                (request, outcome)
            });
            self.lock_in_flight().insert(key, handle);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((request, outcome)) => {
                    self.lock_in_flight()
                        .remove(&(request.execution.id, request.execution.row_version));
                    let committed = self.retry_on_conflict(|| self.commit(&request.execution, &outcome))?;
                    if let Some(execution) = committed {
                        if execution.status == ExecutionStatus::Completed {
                            self.merge_step_output(&execution, &request.step)?;
                        }
                    }
                }
                Err(err) if err.is_cancelled() => debug!("Abandoned dispatch cancelled: {}", err),
                // The row stays RUNNING until the supervisor times it out
                Err(err) => error!("Dispatch task aborted: {}", err),
            }
        }

        debug!("Dispatch batch finished ({} claimed)", claimed);
        Ok(())
    }

    /// PENDING -> RUNNING, with the step input mapped from the current scope.
    fn claim(&self, execution_id: Uuid) -> Result<Option<DispatchRequest>> {
        let mut execution = self.store.get_execution(execution_id)?;
        if execution.status != ExecutionStatus::Pending {
            return Ok(None);
        }
        let instance = self.store.get_instance(execution.instance_id)?;
        if instance.is_terminal() {
            return Ok(None);
        }

        let definition = self.load_definition(&instance)?;
        let step = step_of(&definition, &execution.step_name)?.clone();
        let executions = self.store.executions_for_instance(instance.id);
        let scope = build_scope(&instance, &executions);

        let now = self.clock.now();
        execution.transition(ExecutionStatus::Running, now)?;
        execution.started_at = Some(now);
        execution.timeout_at = Some(now + self.running_deadline(&step, &definition));

        let mapped = ConditionEvaluator::new().map_input(&step.input_mapping, &instance.context_data, &scope);
        match mapped {
            Ok(input) => execution.input_data = input,
            Err(err) => {
                let message = format!("input mapping failed: {}", err);
                execution.fail(message.clone(), false, now)?;
                self.store.update_execution(execution)?;
                warn!("Step '{}' of instance {}: {}", step.step_name, instance.id, message);
                self.record(instance.id, &step.step_name, EventType::Failed, Some(message));
                return Ok(None);
            }
        }

        let execution = self.store.update_execution(execution)?;
        debug!(
            "Claimed step '{}' of instance {} (attempt {})",
            execution.step_name,
            instance.id,
            execution.retry_count + 1
        );
        self.record(instance.id, &execution.step_name, EventType::Started, None);

        Ok(Some(DispatchRequest {
            execution,
            step,
            definition,
            instance,
            scope,
        }))
    }

    /// How long a claimed step may stay RUNNING before it counts as stuck.
    fn running_deadline(&self, step: &WorkflowStepDefinition, definition: &WorkflowDefinition) -> Duration {
        match step.effective_timeout_minutes(definition) {
            Some(minutes) => Duration::minutes(i64::from(minutes)),
            None => Duration::seconds(self.config.service_call_timeout_secs.min(u64::from(u32::MAX)) as i64),
        }
    }

    /// Cancels the dispatch tasks still running for an execution.
    ///
    /// Their rows have already moved on, so the outcomes would be dropped
    /// at commit anyway; aborting frees their dispatch slots.
    pub(crate) fn abandon_dispatch(&self, execution_id: Uuid) -> usize {
        let mut abandoned = 0;
        self.lock_in_flight().retain(|(id, _), handle| {
            if *id != execution_id {
                return true;
            }
            handle.abort();
            abandoned += 1;
            false
        });
        if abandoned > 0 {
            debug!("Abandoned {} dispatch(es) of execution {}", abandoned, execution_id);
        }
        abandoned
    }

    /// Writes a dispatch outcome, unless the row moved on since `claimed`
    /// was taken (supervisor timeout, retry, cancellation) or the instance
    /// terminated.
    fn commit(&self, claimed: &WorkflowExecution, outcome: &StepOutcome) -> Result<Option<WorkflowExecution>> {
        let mut execution = self.store.get_execution(claimed.id)?;
        if execution.status != ExecutionStatus::Running {
            debug!(
                "Dropping outcome for step '{}': row is now {}",
                execution.step_name, execution.status
            );
            return Ok(None);
        }
        if execution.row_version != claimed.row_version {
            debug!(
                "Dropping outcome for step '{}': attempt {} was superseded by attempt {}",
                execution.step_name,
                claimed.retry_count + 1,
                execution.retry_count + 1
            );
            return Ok(None);
        }
        let instance = self.store.get_instance(execution.instance_id)?;
        if instance.is_terminal() {
            debug!(
                "Dropping outcome for step '{}': instance {} is {}",
                execution.step_name, instance.id, instance.status
            );
            return Ok(None);
        }

        let now = self.clock.now();
        let event = match outcome {
            StepOutcome::Completed(output) => {
                execution.output_data = output.clone();
                execution.transition(ExecutionStatus::Completed, now)?;
                EventType::Completed
            }
            StepOutcome::Failed(err) => {
                execution.fail(err.message.clone(), err.retryable, now)?;
                EventType::Failed
            }
            StepOutcome::AwaitingApproval {
                assigned_to,
                timeout_at,
            } => {
                execution.transition(ExecutionStatus::WaitingApproval, now)?;
                execution.assigned_to = assigned_to.clone();
                execution.timeout_at = *timeout_at;
                EventType::WaitingApproval
            }
        };

        let execution = self.store.update_execution(execution)?;
        info!(
            "Step '{}' of instance {} -> {}",
            execution.step_name, execution.instance_id, execution.status
        );
        self.record(
            execution.instance_id,
            &execution.step_name,
            event,
            execution.error_message.clone(),
        );
        Ok(Some(execution))
    }

    /// Projects a completed step's output into the instance context.
    fn merge_step_output(&self, execution: &WorkflowExecution, step: &WorkflowStepDefinition) -> Result<()> {
        let updates = match ConditionEvaluator::new().map_output(&step.output_mapping, &execution.output_data) {
            Ok(updates) => updates,
            Err(err) => {
                warn!(
                    "Output mapping of step '{}' failed, context unchanged: {}",
                    step.step_name, err
                );
                return Ok(());
            }
        };
        if updates.is_empty() {
            return Ok(());
        }

        self.retry_on_conflict(|| {
            let mut instance = self.store.get_instance(execution.instance_id)?;
            if instance.is_terminal() {
                return Ok(());
            }
            instance.context_data.extend(updates.clone());
            instance.updated_at = self.clock.now();
            self.store.update_instance(instance)?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Definition version pinned by an instance.
    pub(crate) fn load_definition(&self, instance: &WorkflowInstance) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get_by_name_and_version(&instance.workflow_name, instance.workflow_version)
            .map(Arc::new)
    }

    /// Moves every active execution of an instance to SKIPPED.
    pub(crate) fn skip_active_executions(&self, id: Uuid, note: &str) -> Result<()> {
        for execution in self.store.executions_for_instance(id) {
            if !execution.status.is_active() {
                continue;
            }
            self.retry_on_conflict(|| {
                let mut execution = self.store.get_execution(execution.id)?;
                if !execution.status.is_active() {
                    return Ok(());
                }
                execution.transition(ExecutionStatus::Skipped, self.clock.now())?;
                execution.error_message = Some(note.to_string());
                self.store.update_execution(execution)?;
                Ok(())
            })?;
            self.record(id, &execution.step_name, EventType::Skipped, Some(note.to_string()));
        }
        Ok(())
    }

    /// Re-runs `op` on optimistic-concurrency conflicts.
    pub(crate) fn retry_on_conflict<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!("Retrying after conflict ({}), attempt {}", err, attempt);
                }
                result => return result,
            }
        }
    }
}

fn step_of<'a>(definition: &'a WorkflowDefinition, step_name: &str) -> Result<&'a WorkflowStepDefinition> {
    definition.step(step_name).ok_or_else(|| {
        EngineError::InvalidState(format!(
            "step '{}' is not part of {}",
            step_name,
            definition.label()
        ))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::DispatchError;
    use crate::execution::store::InMemoryInstanceStore;
    use crate::services::{
        HandlerRegistry, HandlerRequest, LogNotificationService, ServiceInvoker, StaticIdentityService,
        StepHandler, APPROVAL_STATUS_HANDLER, NOOP_HANDLER,
    };
    use crate::workflow::InMemoryDefinitionStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Invoker that fails every call and counts attempts.
    #[derive(Default)]
    pub(crate) struct FailingInvoker {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceInvoker for FailingInvoker {
        async fn invoke(&self, endpoint: &str, _input: &DataMap) -> std::result::Result<DataMap, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::retryable(format!("{} returned 503", endpoint)))
        }
    }

    /// Handler that never finishes; counts how often it was started.
    #[derive(Default)]
    pub(crate) struct StallingHandler {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl StepHandler for StallingHandler {
        async fn execute(&self, _request: HandlerRequest<'_>) -> std::result::Result<DataMap, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Store where another writer wins the next execution update race.
    #[derive(Default)]
    struct ContendedStore {
        inner: InMemoryInstanceStore,
        contend: AtomicBool,
        conflicts: AtomicUsize,
    }

    impl InstanceStore for ContendedStore {
        fn insert_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
            self.inner.insert_instance(instance)
        }

        fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
            self.inner.get_instance(id)
        }

        fn update_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
            self.inner.update_instance(instance)
        }

        fn list_instances(&self, status: Option<InstanceStatus>) -> Vec<WorkflowInstance> {
            self.inner.list_instances(status)
        }

        fn find_active_by_business_key(&self, business_key: &str) -> Option<WorkflowInstance> {
            self.inner.find_active_by_business_key(business_key)
        }

        fn insert_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution> {
            self.inner.insert_execution(execution)
        }

        fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution> {
            self.inner.get_execution(id)
        }

        fn update_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution> {
            if self.contend.swap(false, Ordering::SeqCst) {
                // The other writer re-saves the row, moving its version on
                let current = self.inner.get_execution(execution.id)?;
                self.inner.update_execution(current)?;
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.update_execution(execution)
        }

        fn executions_for_instance(&self, instance_id: Uuid) -> Vec<WorkflowExecution> {
            self.inner.executions_for_instance(instance_id)
        }

        fn executions_by_status(&self, status: ExecutionStatus) -> Vec<WorkflowExecution> {
            self.inner.executions_by_status(status)
        }

        fn all_executions(&self) -> Vec<WorkflowExecution> {
            self.inner.all_executions()
        }
    }

    pub(crate) struct Harness {
        pub engine: Engine,
        pub clock: Arc<ManualClock>,
        pub identity: Arc<StaticIdentityService>,
        pub notifications: Arc<LogNotificationService>,
        pub invoker: Arc<FailingInvoker>,
        pub stalls: Arc<StallingHandler>,
    }

    pub(crate) fn harness() -> Harness {
        harness_with(EngineConfig::default(), Arc::new(InMemoryInstanceStore::new()))
    }

    pub(crate) fn harness_with(config: EngineConfig, store: Arc<dyn InstanceStore>) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let identity = Arc::new(
            StaticIdentityService::new()
                .with_user("alice", ["CLINIC_ADMIN"])
                .with_user("carol", ["HR"]),
        );
        let notifications = Arc::new(LogNotificationService::new());
        let invoker = Arc::new(FailingInvoker::default());
        let stalls = Arc::new(StallingHandler::default());

        let mut handlers = HandlerRegistry::with_builtins(identity.clone());
        handlers.register("validate", Arc::new(crate::services::invoker::NoopHandler));
        handlers.register("stall", stalls.clone());

        let dispatcher = StepDispatcher::new(
            identity.clone(),
            notifications.clone(),
            invoker.clone(),
            handlers,
            clock.clone(),
        );
        let engine = Engine::new(
            config,
            Arc::new(InMemoryDefinitionStore::new()),
            store,
            dispatcher,
            clock.clone(),
        );

        Harness {
            engine,
            clock,
            identity,
            notifications,
            invoker,
            stalls,
        }
    }

    /// validate -> clinic-admin-review -> activate
    pub(crate) fn onboarding() -> WorkflowDefinition {
        WorkflowDefinition::new("staff-onboarding", 1)
            .with_category("staff")
            .with_step(WorkflowStepDefinition::new("validate", 1, StepType::Automatic))
            .with_step(
                WorkflowStepDefinition::new("clinic-admin-review", 2, StepType::Approval)
                    .with_approval_roles(["CLINIC_ADMIN"])
                    .with_timeout_minutes(1440),
            )
            .with_step(
                WorkflowStepDefinition::new("activate", 3, StepType::Automatic)
                    .with_endpoint(APPROVAL_STATUS_HANDLER),
            )
    }

    fn context(pairs: serde_json::Value) -> DataMap {
        pairs.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_scenario_a_approval_completes_instance() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42").with_business_key("staff-42"))
            .await
            .unwrap();

        assert_eq!(view.instance.status, InstanceStatus::Running);
        assert_eq!(view.execution("validate").unwrap().status, ExecutionStatus::Completed);
        let review = view.execution("clinic-admin-review").unwrap();
        assert_eq!(review.status, ExecutionStatus::WaitingApproval);
        assert_eq!(review.assigned_to, vec!["alice"]);
        assert!(view.execution("activate").is_none());
        assert_eq!(view.instance.current_step_name.as_deref(), Some("clinic-admin-review"));

        let decided = h
            .engine
            .resolve_approval(review.id, "alice", true, Some("looks good"))
            .await
            .unwrap();
        assert_eq!(decided.status, ExecutionStatus::Completed);
        assert_eq!(decided.approved_by.as_deref(), Some("alice"));
        assert_eq!(decided.approval_notes.as_deref(), Some("looks good"));

        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Completed);
        assert_eq!(view.execution("activate").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(view.instance.output_data["approvalStatus"], json!("APPROVED"));
        assert!(view.instance.completed_at.is_some());

        // Approval output flowed through context into the activation handler
        let updates = h.identity.status_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].entity_id, "42");
        assert_eq!(updates[0].approver_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_scenario_b_rejection_fails_instance() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();
        let review = view.execution("clinic-admin-review").unwrap().id;

        let decided = h
            .engine
            .resolve_approval(review, "alice", false, Some("missing licence"))
            .await
            .unwrap();
        assert_eq!(decided.status, ExecutionStatus::Failed);
        assert_eq!(decided.error_message.as_deref(), Some("rejected by alice: missing licence"));

        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Failed);
        assert!(view.instance.error_message.as_deref().unwrap().contains("missing licence"));
        assert!(view.execution("activate").is_none());
        assert!(h.identity.status_updates().is_empty());
    }

    #[tokio::test]
    async fn test_optional_rejection_skips_step() {
        let h = harness();
        let def = WorkflowDefinition::new("optional-review", 1)
            .with_step(
                WorkflowStepDefinition::new("peer-review", 1, StepType::Approval)
                    .with_approval_roles(["HR"])
                    .optional(),
            )
            .with_step(WorkflowStepDefinition::new("finish", 2, StepType::Automatic).with_endpoint(NOOP_HANDLER));
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("optional-review", "Staff", "1"))
            .await
            .unwrap();
        let review = view.execution("peer-review").unwrap().id;

        let decided = h.engine.resolve_approval(review, "carol", false, None).await.unwrap();
        assert_eq!(decided.status, ExecutionStatus::Skipped);
        assert_eq!(decided.error_message.as_deref(), Some("rejected by carol"));

        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_resolve_approval_errors() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();

        let review = view.execution("clinic-admin-review").unwrap().id;
        let err = h.engine.resolve_approval(review, "carol", true, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { ref user, .. } if user == "carol"));

        let validate = view.execution("validate").unwrap().id;
        let err = h.engine.resolve_approval(validate, "alice", true, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotWaiting(id) if id == validate));

        let err = h.engine.resolve_approval(Uuid::new_v4(), "alice", true, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        // A decided step cannot be decided twice
        h.engine.resolve_approval(review, "alice", true, None).await.unwrap();
        let err = h.engine.resolve_approval(review, "alice", false, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotWaiting(_)));
    }

    #[tokio::test]
    async fn test_approval_survives_concurrent_write() {
        let store = Arc::new(ContendedStore::default());
        let h = harness_with(EngineConfig::default(), store.clone());
        h.engine.register_definition(onboarding()).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();
        let review = view.execution("clinic-admin-review").unwrap().id;

        store.contend.store(true, Ordering::SeqCst);
        let decided = h.engine.resolve_approval(review, "alice", true, None).await.unwrap();

        assert_eq!(store.conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(decided.status, ExecutionStatus::Completed);
        assert_eq!(decided.approved_by.as_deref(), Some("alice"));
        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_approval_resumes_waiting_instance() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();
        let review = view.execution("clinic-admin-review").unwrap().id;

        // Parked by an outside tool while the approval is open
        let store = h.engine.store();
        let mut instance = store.get_instance(view.instance.id).unwrap();
        instance.transition(InstanceStatus::Waiting, h.clock.now()).unwrap();
        store.update_instance(instance).unwrap();

        h.engine.resolve_approval(review, "alice", true, None).await.unwrap();

        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Completed);
        assert_eq!(view.execution("activate").unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_superseded_attempt_outcome_is_dropped() {
        let h = harness();
        let def = WorkflowDefinition::new("provisioning", 1).with_step(
            WorkflowStepDefinition::new("validate", 1, StepType::Automatic).with_timeout_minutes(5),
        );
        h.engine.register_definition(def).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("provisioning", "Staff", "42").with_auto_start(false))
            .await
            .unwrap();
        let id = view.instance.id;

        h.engine.retry_on_conflict(|| h.engine.begin(id)).unwrap();
        let pending = h.engine.plan_step(id).unwrap();
        assert_eq!(pending.len(), 1);
        let first = h.engine.claim(pending[0].id).unwrap().unwrap();

        // Attempt 1 is given up on as stuck, retried, and attempt 2 claimed
        let store = h.engine.store();
        let mut row = store.get_execution(first.execution.id).unwrap();
        row.fail("step timed out while running", true, h.clock.now()).unwrap();
        let mut row = store.update_execution(row).unwrap();
        row.transition(ExecutionStatus::Pending, h.clock.now()).unwrap();
        row.retry_count += 1;
        row.error_message = None;
        row.retryable = false;
        store.update_execution(row).unwrap();
        let second = h.engine.claim(first.execution.id).unwrap().unwrap();
        assert_eq!(second.execution.status, ExecutionStatus::Running);

        let late = StepOutcome::Failed(DispatchError::retryable("late failure of attempt 1"));
        assert!(h.engine.commit(&first.execution, &late).unwrap().is_none());
        let row = store.get_execution(first.execution.id).unwrap();
        assert_eq!(row.status, ExecutionStatus::Running);
        assert!(row.error_message.is_none());

        let committed = h
            .engine
            .commit(&second.execution, &StepOutcome::Completed(DataMap::new()))
            .unwrap()
            .unwrap();
        assert_eq!(committed.status, ExecutionStatus::Completed);
        assert_eq!(committed.retry_count, 1);

        h.engine.advance(id).await.unwrap();
        assert_eq!(h.engine.get_instance(id).unwrap().instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_abandon_dispatch_cancels_in_flight_task() {
        let h = harness();
        let def = WorkflowDefinition::new("stalled", 1)
            .with_step(WorkflowStepDefinition::new("stall", 1, StepType::Automatic).with_timeout_minutes(5));
        h.engine.register_definition(def).unwrap();

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start(StartRequest::new("stalled", "Staff", "42")).await });
        while h.stalls.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let instance = h.engine.list_instances(None).remove(0);
        let stall = h.engine.get_instance(instance.id).unwrap().executions.remove(0);
        assert_eq!(stall.status, ExecutionStatus::Running);

        // Move the row on first, as the supervisor does, then abandon
        let store = h.engine.store();
        let mut row = store.get_execution(stall.id).unwrap();
        row.fail("step timed out while running", true, h.clock.now()).unwrap();
        store.update_execution(row).unwrap();
        assert_eq!(h.engine.abandon_dispatch(stall.id), 1);
        assert_eq!(h.engine.abandon_dispatch(stall.id), 0);

        let view = tokio::time::timeout(std::time::Duration::from_secs(2), run)
            .await
            .expect("start returns once its dispatch is abandoned")
            .unwrap()
            .unwrap();
        let stall = view.execution("stall").unwrap();
        assert_eq!(stall.status, ExecutionStatus::Failed);
        assert!(stall.retryable);
        assert_eq!(view.instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_business_key_idempotency() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let request = StartRequest::new("staff-onboarding", "Staff", "42").with_business_key("staff-42");

        let first = h.engine.start(request.clone()).await.unwrap();
        let err = h.engine.start(request.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateInstance(ref key) if key == "staff-42"));
        assert_eq!(h.engine.list_instances(None).len(), 1);
        assert_eq!(
            h.engine.store().find_active_by_business_key("staff-42").unwrap().id,
            first.instance.id
        );

        // No key never collides
        h.engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();

        // Terminal holder frees the key
        h.engine.cancel(first.instance.id, "duplicate request").unwrap();
        let second = h.engine.start(request).await.unwrap();
        assert_ne!(second.instance.id, first.instance.id);
    }

    #[tokio::test]
    async fn test_start_validation_and_lookup() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();

        let err = h
            .engine
            .start(StartRequest::new("staff-onboarding", "", "42"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = h
            .engine
            .start(StartRequest::new("unknown", "Staff", "42"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42").with_version(7))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_instances_pin_their_version() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let v1 = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "1"))
            .await
            .unwrap();

        let mut v2 = onboarding();
        v2.version = 2;
        v2.steps.retain(|s| s.step_name != "clinic-admin-review");
        h.engine.register_definition(v2).unwrap();

        let latest = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "2"))
            .await
            .unwrap();
        assert_eq!(latest.instance.workflow_version, 2);
        assert_eq!(latest.instance.status, InstanceStatus::Completed);

        // The v1 instance still waits on the step v2 removed
        let review = v1.execution("clinic-admin-review").unwrap().id;
        h.engine.resolve_approval(review, "alice", true, None).await.unwrap();
        let v1 = h.engine.get_instance(v1.instance.id).unwrap();
        assert_eq!(v1.instance.workflow_version, 1);
        assert_eq!(v1.instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_manual_start_then_resume() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42").with_auto_start(false))
            .await
            .unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Created);
        assert!(view.executions.is_empty());

        let view = h.engine.resume(view.instance.id).await.unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Running);
        assert!(view.instance.started_at.is_some());
        assert_eq!(
            view.execution("clinic-admin-review").unwrap().status,
            ExecutionStatus::WaitingApproval
        );
    }

    #[tokio::test]
    async fn test_cancel_skips_active_executions() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();

        let cancelled = h.engine.cancel(view.instance.id, "staff member withdrew").unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some("cancelled: staff member withdrew"));

        let view = h.engine.get_instance(view.instance.id).unwrap();
        let review = view.execution("clinic-admin-review").unwrap();
        assert_eq!(review.status, ExecutionStatus::Skipped);
        assert_eq!(review.error_message.as_deref(), Some("cancelled: staff member withdrew"));
        // Finished work is left as it was
        assert_eq!(view.execution("validate").unwrap().status, ExecutionStatus::Completed);

        let err = h.engine.cancel(view.instance.id, "again").unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let err = h.engine.resolve_approval(review.id, "alice", true, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotWaiting(_)));
    }

    #[tokio::test]
    async fn test_false_guard_skips_without_dispatch() {
        let h = harness();
        let def = WorkflowDefinition::new("guarded", 1)
            .with_step(WorkflowStepDefinition::new("validate", 1, StepType::Automatic))
            .with_step(
                WorkflowStepDefinition::new("provision", 2, StepType::ServiceCall)
                    .with_endpoint("accounts")
                    .with_condition("context.department == 'radiology'"),
            )
            .with_step(
                WorkflowStepDefinition::new("is-senior", 3, StepType::Conditional)
                    .with_condition("context.grade == 'senior'"),
            );
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(
                StartRequest::new("guarded", "Staff", "42")
                    .with_context(context(json!({ "department": "oncology", "grade": "senior" }))),
            )
            .await
            .unwrap();

        assert_eq!(view.instance.status, InstanceStatus::Completed);
        assert_eq!(view.execution("provision").unwrap().status, ExecutionStatus::Skipped);
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 0);

        let gate = view.execution("is-senior").unwrap();
        assert_eq!(gate.status, ExecutionStatus::Completed);
        assert_eq!(gate.output_data["result"], json!(true));
    }

    #[tokio::test]
    async fn test_guard_error_fails_permanently() {
        let h = harness();
        let def = WorkflowDefinition::new("broken-guard", 1).with_step(
            WorkflowStepDefinition::new("validate", 1, StepType::Automatic).with_condition("context.a ==="),
        );
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("broken-guard", "Staff", "42"))
            .await
            .unwrap();
        let exec = view.execution("validate").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(!exec.retryable);
        assert_eq!(view.instance.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_input_mapping_error_fails_instance() {
        let h = harness();
        let def = WorkflowDefinition::new("broken-mapping", 1).with_step(
            WorkflowStepDefinition::new("validate", 1, StepType::Automatic).map_input("staffId", "context.a ==="),
        );
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("broken-mapping", "Staff", "42"))
            .await
            .unwrap();
        let exec = view.execution("validate").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error_message.as_deref().unwrap().starts_with("input mapping failed"));
        assert_eq!(view.instance.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_parallel_group_runs_together() {
        let h = harness();
        let def = WorkflowDefinition::new("parallel", 1)
            .with_step(WorkflowStepDefinition::new("validate", 1, StepType::Automatic))
            .with_step(
                WorkflowStepDefinition::new("notify-hr", 2, StepType::Notification)
                    .parallel()
                    .with_template("New starter {{ context.staffName }}")
                    .map_input("recipient", "context.hrEmail"),
            )
            .with_step(
                WorkflowStepDefinition::new("review", 2, StepType::Approval)
                    .parallel()
                    .with_approval_roles(["HR"]),
            )
            .with_step(WorkflowStepDefinition::new("finish", 3, StepType::Automatic).with_endpoint(NOOP_HANDLER));
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(
                StartRequest::new("parallel", "Staff", "42")
                    .with_context(context(json!({ "staffName": "Jordan", "hrEmail": "hr@clinic" }))),
            )
            .await
            .unwrap();

        assert_eq!(view.execution("notify-hr").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(view.execution("review").unwrap().status, ExecutionStatus::WaitingApproval);
        assert!(view.execution("finish").is_none());
        assert_eq!(view.instance.current_step_order, Some(2));

        let sent = h.notifications.sent();
        assert_eq!(sent[0].recipient, "hr@clinic");
        assert_eq!(sent[0].template, "New starter Jordan");

        let review = view.execution("review").unwrap().id;
        h.engine.resolve_approval(review, "carol", true, None).await.unwrap();
        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_parallel_failure_waits_for_peers() {
        let h = harness();
        let def = WorkflowDefinition::new("parallel-fail", 1)
            .with_step(
                WorkflowStepDefinition::new("provision", 1, StepType::ServiceCall)
                    .parallel()
                    .with_endpoint("accounts")
                    .with_retry_attempts(0),
            )
            .with_step(
                WorkflowStepDefinition::new("review", 1, StepType::Approval)
                    .parallel()
                    .with_approval_roles(["HR"]),
            );
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("parallel-fail", "Staff", "42"))
            .await
            .unwrap();
        assert_eq!(view.execution("provision").unwrap().status, ExecutionStatus::Failed);
        // Peer still open, instance keeps running
        assert_eq!(view.instance.status, InstanceStatus::Running);

        let review = view.execution("review").unwrap().id;
        h.engine.resolve_approval(review, "carol", true, None).await.unwrap();
        let view = h.engine.get_instance(view.instance.id).unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Failed);
        assert!(view.instance.error_message.as_deref().unwrap().contains("accounts returned 503"));
    }

    #[tokio::test]
    async fn test_output_mapping_feeds_later_steps() {
        let h = harness();
        let def = WorkflowDefinition::new("mapping", 1)
            .with_step(
                WorkflowStepDefinition::new("validate", 1, StepType::Automatic)
                    .map_input("dept", "context.department")
                    .map_output("validatedDept", "output.dept"),
            )
            .with_step(
                WorkflowStepDefinition::new("radiology-only", 2, StepType::Automatic)
                    .with_endpoint(NOOP_HANDLER)
                    .with_condition("context.validatedDept == 'radiology'"),
            );
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(
                StartRequest::new("mapping", "Staff", "42")
                    .with_context(context(json!({ "department": "radiology" }))),
            )
            .await
            .unwrap();

        assert_eq!(view.execution("validate").unwrap().input_data.len(), 1);
        assert_eq!(view.instance.context_data["validatedDept"], json!("radiology"));
        assert_eq!(view.execution("radiology-only").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(view.instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_instance() {
        let h = harness();
        let def = WorkflowDefinition::new("unhandled", 1)
            .with_step(WorkflowStepDefinition::new("mystery", 1, StepType::Automatic));
        h.engine.register_definition(def).unwrap();

        let view = h
            .engine
            .start(StartRequest::new("unhandled", "Staff", "42"))
            .await
            .unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Failed);
        assert!(view.instance.error_message.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn test_pending_approvals_queries() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        h.engine
            .start(StartRequest::new("staff-onboarding", "Staff", "1"))
            .await
            .unwrap();
        h.engine
            .start(StartRequest::new("staff-onboarding", "Staff", "2"))
            .await
            .unwrap();

        assert_eq!(h.engine.pending_approvals_for_role("CLINIC_ADMIN").len(), 2);
        assert!(h.engine.pending_approvals_for_role("HR").is_empty());
        assert_eq!(h.engine.pending_approvals_for_user("alice").await.unwrap().len(), 2);
        assert!(h.engine.pending_approvals_for_user("carol").await.unwrap().is_empty());

        // Roles granted after assignment still count
        h.identity.grant("dave", "CLINIC_ADMIN");
        assert_eq!(h.engine.pending_approvals_for_user("dave").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timeline_and_snapshot() {
        let h = harness();
        h.engine.register_definition(onboarding()).unwrap();
        let view = h
            .engine
            .start(StartRequest::new("staff-onboarding", "Staff", "42"))
            .await
            .unwrap();

        h.clock.advance(Duration::minutes(30));
        let review = view.execution("clinic-admin-review").unwrap().id;
        h.engine.resolve_approval(review, "alice", true, None).await.unwrap();

        let timeline = h.engine.timeline(view.instance.id).unwrap();
        assert_eq!(timeline.durations()["clinic-admin-review"], Duration::minutes(30));
        assert!(timeline.summary().contains("activate"));

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.definitions.len(), 1);
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.executions.len(), 3);
    }
}
