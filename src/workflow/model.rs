//! Workflow Definition Model
//!
//! Versioned, reusable workflow templates and their ordered step
//! definitions.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: staff-onboarding
//! version: 1
//! displayName: Staff onboarding
//! category: staff
//! timeoutMinutes: 4320
//! maxRetryAttempts: 2
//! steps:
//!   - stepName: validate
//!     stepOrder: 1
//!     stepType: AUTOMATIC
//!     serviceEndpoint: noop
//!
//!   - stepName: clinic-admin-review
//!     stepOrder: 2
//!     stepType: APPROVAL
//!     approvalRoles: CLINIC_ADMIN
//!     timeoutMinutes: 1440
//!
//!   - stepName: activate
//!     stepOrder: 3
//!     stepType: AUTOMATIC
//!     serviceEndpoint: identity:update-approval-status
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured key-value payload carried between steps.
pub type DataMap = serde_json::Map<String, Value>;

/// The kind of work a step performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// Runs an internal handler
    Automatic,
    /// Suspends until an authorized user approves or rejects
    Approval,
    /// Sends a templated message through the notification boundary
    Notification,
    /// Invokes an external service endpoint
    ServiceCall,
    /// Pure guard evaluated by the engine itself
    Conditional,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Automatic => "AUTOMATIC",
            Self::Approval => "APPROVAL",
            Self::Notification => "NOTIFICATION",
            Self::ServiceCall => "SERVICE_CALL",
            Self::Conditional => "CONDITIONAL",
        };
        write!(f, "{}", name)
    }
}

/// A single step within a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepDefinition {
    /// Name unique within the definition
    pub step_name: String,

    /// Default sequencing; equal orders form a parallel group
    pub step_order: u32,

    pub step_type: StepType,

    #[serde(default = "default_true")]
    pub is_required: bool,

    /// Runs concurrently with other parallel steps of the same order
    #[serde(default)]
    pub is_parallel: bool,

    /// Overrides the definition-level timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,

    /// Overrides the definition-level retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,

    /// Guard evaluated against the instance scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<String>,

    /// Roles allowed to resolve an APPROVAL step
    #[serde(deserialize_with = "single_or_vec", default)]
    pub approval_roles: Vec<String>,

    /// Target of a SERVICE_CALL, or handler key of an AUTOMATIC step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,

    /// Template name used by NOTIFICATION steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_template: Option<String>,

    /// Step input key -> expression over the instance scope
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,

    /// Context key -> expression over `{ output }`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

fn default_max_retry_attempts() -> u32 {
    3
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl WorkflowStepDefinition {
    /// Creates a required, sequential step.
    ///
    /// # Example
    ///
    /// ```
    /// use flowgate::workflow::{StepType, WorkflowStepDefinition};
    ///
    /// let step = WorkflowStepDefinition::new("review", 2, StepType::Approval)
    ///     .with_approval_roles(["CLINIC_ADMIN"])
    ///     .with_timeout_minutes(60);
    /// assert_eq!(step.approval_roles, vec!["CLINIC_ADMIN"]);
    /// ```
    pub fn new(step_name: impl Into<String>, step_order: u32, step_type: StepType) -> Self {
        Self {
            step_name: step_name.into().trim().to_string(),
            step_order,
            step_type,
            is_required: true,
            is_parallel: false,
            timeout_minutes: None,
            retry_attempts: None,
            condition_expression: None,
            approval_roles: Vec::new(),
            service_endpoint: None,
            notification_template: None,
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            description: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.is_parallel = true;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition_expression = Some(expression.into());
        self
    }

    pub fn with_approval_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approval_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.service_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.notification_template = Some(template.into());
        self
    }

    pub fn map_input(mut self, key: impl Into<String>, expression: impl Into<String>) -> Self {
        self.input_mapping.insert(key.into(), expression.into());
        self
    }

    pub fn map_output(mut self, key: impl Into<String>, expression: impl Into<String>) -> Self {
        self.output_mapping.insert(key.into(), expression.into());
        self
    }

    /// Retry budget, falling back to the definition's default.
    pub fn effective_retry_bound(&self, definition: &WorkflowDefinition) -> u32 {
        self.retry_attempts.unwrap_or(definition.max_retry_attempts)
    }

    /// Step timeout, falling back to the definition's ceiling.
    pub fn effective_timeout_minutes(&self, definition: &WorkflowDefinition) -> Option<u32> {
        self.timeout_minutes.or(definition.timeout_minutes)
    }
}

/// An immutable, versioned workflow template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique key shared by every version
    pub name: String,

    /// Monotonic per name
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub category: String,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub is_system_workflow: bool,

    /// Ceiling on total instance lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,

    /// Default retry budget for steps that don't override it
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Start running immediately unless a start request says otherwise
    #[serde(default = "default_true")]
    pub auto_start: bool,

    #[serde(default)]
    pub requires_approval: bool,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub configuration: Value,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_schema: Value,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output_schema: Value,

    /// Steps in ascending `step_order`
    #[serde(default)]
    pub steps: Vec<WorkflowStepDefinition>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates an active definition with no steps.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        let name = name.into().trim().to_string();
        Self {
            display_name: name.clone(),
            name,
            version,
            description: None,
            category: String::new(),
            is_active: true,
            is_system_workflow: false,
            timeout_minutes: None,
            max_retry_attempts: default_max_retry_attempts(),
            auto_start: true,
            requires_approval: false,
            configuration: Value::Null,
            input_schema: Value::Null,
            output_schema: Value::Null,
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_step(mut self, step: WorkflowStepDefinition) -> Self {
        self.requires_approval |= step.step_type == StepType::Approval;
        self.steps.push(step);
        self
    }

    /// Gets a step by name.
    pub fn step(&self, step_name: &str) -> Option<&WorkflowStepDefinition> {
        self.steps.iter().find(|s| s.step_name == step_name)
    }

    /// Steps grouped by order, ascending.
    pub fn groups(&self) -> BTreeMap<u32, Vec<&WorkflowStepDefinition>> {
        let mut groups: BTreeMap<u32, Vec<&WorkflowStepDefinition>> = BTreeMap::new();
        for step in &self.steps {
            groups.entry(step.step_order).or_default().push(step);
        }
        groups
    }

    /// Sorts steps by order, keeping declaration order within a group.
    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|s| s.step_order);
    }

    /// Human-readable `name@vN` label.
    pub fn label(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }

    /// Returns the number of steps in the definition.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
