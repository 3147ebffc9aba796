//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading,
//! validating and storing versioned workflow templates.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, WorkflowStepDefinition)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules
//! - [`registry`]: The Definition Store
//! - [`condition`]: Guard, mapping and template evaluation

pub mod condition;
pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;

pub use condition::{render_template, ConditionEvaluator, ExpressionError};
pub use model::{DataMap, StepType, WorkflowDefinition, WorkflowStepDefinition};
pub use parser::{load_definitions, parse_definitions};
pub use registry::{DefinitionStore, InMemoryDefinitionStore};
pub use validator::{quick_validate, validate_definition, ValidationError};
