//! Flowgate - Workflow Orchestration Engine
//!
//! Drives long-running, multi-step business processes such as staff
//! onboarding or credential approval through versioned workflow
//! definitions. Steps run automatically, wait on human approvals, send
//! notifications, or call external services; a supervisor enforces
//! timeouts and retries.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Definition model, YAML parsing, validation and the Definition Store
//! - [`execution`]: Instance Store, Step Dispatcher, engine and Supervisor
//! - [`services`]: Boundary ports to identity, notification and service backends
//! - [`monitoring`]: Per-instance execution timeline
//! - [`config`]: Engine settings
//! - [`clock`]: Injectable time source
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowgate::prelude::*;
//!
//! # async fn run() -> flowgate::Result<()> {
//! let clock = Arc::new(SystemClock);
//! let identity = Arc::new(StaticIdentityService::new().with_user("alice", ["CLINIC_ADMIN"]));
//! let handlers = HandlerRegistry::with_builtins(identity.clone());
//! let dispatcher = StepDispatcher::new(
//!     identity,
//!     Arc::new(LogNotificationService::new()),
//!     Arc::new(HandlerServiceInvoker::new(handlers.clone())),
//!     handlers,
//!     clock.clone(),
//! );
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryDefinitionStore::new()),
//!     Arc::new(InMemoryInstanceStore::new()),
//!     dispatcher,
//!     clock,
//! );
//!
//! for definition in load_definitions("workflows.yaml")? {
//!     engine.register_definition(definition)?;
//! }
//!
//! let view = engine
//!     .start(StartRequest::new("staff-onboarding", "Staff", "42"))
//!     .await?;
//! let supervisor = Supervisor::new(engine.clone());
//! supervisor.run_cycle().await?;
//! supervisor.settle().await;
//! println!("{}", engine.timeline(view.instance.id)?.summary());
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod services;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{DispatchError, EngineError, Result};
pub use execution::{Engine, StartRequest, Supervisor};
pub use workflow::{load_definitions, WorkflowDefinition, WorkflowStepDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Flowgate";

/// Everything needed to wire up and drive an engine.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::error::{DispatchError, EngineError, Result};
    pub use crate::execution::{
        Engine, ExecutionStatus, InMemoryInstanceStore, InstanceStatus, InstanceStore, InstanceView,
        StartRequest, StepDispatcher, Supervisor,
    };
    pub use crate::services::{
        HandlerRegistry, HandlerServiceInvoker, IdentityService, LogNotificationService,
        NotificationService, ServiceInvoker, StaticIdentityService, StepHandler,
    };
    pub use crate::workflow::{
        load_definitions, DataMap, DefinitionStore, InMemoryDefinitionStore, StepType,
        WorkflowDefinition, WorkflowStepDefinition,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Flowgate");
    }

    #[test]
    fn test_module_exports_definition() {
        let def = WorkflowDefinition::new("staff-onboarding", 1).with_step(WorkflowStepDefinition::new(
            "validate",
            1,
            workflow::StepType::Automatic,
        ));
        assert_eq!(def.len(), 1);
        assert_eq!(def.label(), "staff-onboarding@v1");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
