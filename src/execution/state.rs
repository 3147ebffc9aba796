//! Instance and Execution Records
//!
//! Runtime records for started processes and individual step attempts,
//! together with the two status state machines that govern them.
//!
//! Every record carries a `row_version` token. Stores compare it on each
//! write and bump it on success, so two writers racing on the same row
//! cannot silently overwrite each other.
//!
//! [`Snapshot`] persists the full store contents to a JSON file, enabling
//! state to survive between process runs.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::workflow::{DataMap, StepType, WorkflowDefinition, WorkflowStepDefinition};

/// Lifecycle of a workflow instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Created,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Created, Running | Failed | Cancelled | Timeout)
                | (Running, Waiting | Completed | Failed | Cancelled | Timeout)
                | (Waiting, Running | Cancelled | Timeout)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of a single step attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    /// Pending, running or parked on a human decision.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::WaitingApproval)
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Skipped)
                | (Running, Completed | Failed | WaitingApproval | Skipped)
                | (WaitingApproval, Completed | Failed | Skipped)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{}", name)
    }
}

/// One started process, bound to a business entity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: Uuid,

    /// Pinned definition name and version
    pub workflow_name: String,
    pub workflow_version: u32,

    pub instance_name: String,
    pub status: InstanceStatus,

    /// Idempotency key, unique among non-terminal instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,

    pub entity_type: String,
    pub entity_id: String,
    pub priority: i32,

    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: DataMap,
    #[serde(default)]
    pub context_data: DataMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Retries performed across all of this instance's steps
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency token
    #[serde(default)]
    pub row_version: u64,
}

impl WorkflowInstance {
    /// Creates an instance in CREATED, pinned to `definition`.
    pub fn new(
        definition: &WorkflowDefinition,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self {
            id: Uuid::new_v4(),
            workflow_name: definition.name.clone(),
            workflow_version: definition.version,
            instance_name: format!("{} {}:{}", definition.name, entity_type, entity_id),
            status: InstanceStatus::Created,
            business_key: None,
            entity_type,
            entity_id,
            priority: 0,
            input_data: DataMap::new(),
            output_data: DataMap::new(),
            context_data: DataMap::new(),
            current_step_order: None,
            current_step_name: None,
            error_message: None,
            retry_count: 0,
            started_by: None,
            started_at: None,
            completed_at: None,
            timeout_at: None,
            created_at: now,
            updated_at: now,
            row_version: 0,
        }
    }

    /// Moves to `next`, stamping completion time on terminal states.
    pub fn transition(&mut self, next: InstanceStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "instance {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One attempt record of one step within an instance.
///
/// Retries reuse the same record and bump `retry_count`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub instance_id: Uuid,

    pub step_name: String,
    pub step_type: StepType,
    pub step_order: u32,
    pub is_parallel: bool,
    pub is_required: bool,

    pub status: ExecutionStatus,

    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: DataMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    /// Whether the last failure may be retried
    #[serde(default)]
    pub retryable: bool,

    /// Candidate approvers resolved from the step's roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assigned_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency token
    #[serde(default)]
    pub row_version: u64,
}

impl WorkflowExecution {
    /// Creates a PENDING execution for a step.
    pub fn new(instance_id: Uuid, step: &WorkflowStepDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            step_name: step.step_name.clone(),
            step_type: step.step_type,
            step_order: step.step_order,
            is_parallel: step.is_parallel,
            is_required: step.is_required,
            status: ExecutionStatus::Pending,
            input_data: DataMap::new(),
            output_data: DataMap::new(),
            error_message: None,
            retry_count: 0,
            retryable: false,
            assigned_to: Vec::new(),
            approved_by: None,
            approval_notes: None,
            started_at: None,
            completed_at: None,
            timeout_at: None,
            created_at: now,
            updated_at: now,
            row_version: 0,
        }
    }

    /// Moves to `next`, stamping completion time where it applies.
    pub fn transition(&mut self, next: ExecutionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "execution {} ({}) cannot move from {} to {}",
                self.id, self.step_name, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        match next {
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped => {
                self.completed_at = Some(now);
            }
            ExecutionStatus::Pending => {
                self.completed_at = None;
                self.timeout_at = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Records a failure.
    pub fn fail(&mut self, message: impl Into<String>, retryable: bool, now: DateTime<Utc>) -> Result<()> {
        self.transition(ExecutionStatus::Failed, now)?;
        self.error_message = Some(message.into());
        self.retryable = retryable;
        Ok(())
    }

    /// True once no further attempt will be made for this step.
    pub fn is_settled(&self, retry_bound: u32) -> bool {
        match self.status {
            ExecutionStatus::Completed | ExecutionStatus::Skipped => true,
            ExecutionStatus::Failed => self.retries_exhausted(retry_bound),
            _ => false,
        }
    }

    /// True when a failed execution may not be attempted again.
    pub fn retries_exhausted(&self, retry_bound: u32) -> bool {
        !self.retryable || self.retry_count >= retry_bound
    }
}

/// Serializable copy of every store, used for file persistence.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Snapshot {
    #[serde(default)]
    pub definitions: Vec<WorkflowDefinition>,
    #[serde(default)]
    pub instances: Vec<WorkflowInstance>,
    #[serde(default)]
    pub executions: Vec<WorkflowExecution>,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    /// Saves the snapshot as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        info!(
            "Saved state to {} ({} instances, {} executions)",
            path.display(),
            self.instances.len(),
            self.executions.len()
        );
        Ok(())
    }

    /// Loads a snapshot; a missing file yields an empty snapshot.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No state file at {}, starting fresh", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        info!(
            "Loaded state from {} ({} definitions, {} instances)",
            path.display(),
            snapshot.definitions.len(),
            snapshot.instances.len()
        );
        Ok(snapshot)
    }
}
