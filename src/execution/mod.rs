//! Workflow Execution Module
//!
//! Runs workflow instances: persists their state, dispatches steps to
//! external services, and enforces timeouts and retries.
//!
//! # Architecture
//!
//! - [`state`]: Instance and execution records with their status machines
//! - [`store`]: The Instance Store with optimistic concurrency
//! - [`planner`]: Decides the next group of steps for an instance
//! - [`step`]: The Step Dispatcher
//! - [`engine`]: Main engine driving instances through their definitions
//! - [`supervisor`]: Periodic timeout and retry enforcement

pub mod engine;
pub mod planner;
pub mod state;
pub mod step;
pub mod store;
pub mod supervisor;

pub use engine::{Engine, InstanceView, StartRequest};
pub use state::{ExecutionStatus, InstanceStatus, Snapshot, WorkflowExecution, WorkflowInstance};
pub use step::{DispatchRequest, StepDispatcher, StepOutcome};
pub use store::{InMemoryInstanceStore, InstanceStore};
pub use supervisor::{CycleReport, Supervisor, APPROVAL_TIMEOUT};
