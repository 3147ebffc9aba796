//! Boundary Services
//!
//! Ports to the collaborators the engine calls mid-workflow, each with an
//! in-process implementation.
//!
//! - [`identity`]: role lookup and approval status write-back
//! - [`notification`]: templated message delivery
//! - [`invoker`]: downstream service calls and AUTOMATIC step handlers

pub mod identity;
pub mod invoker;
pub mod notification;

pub use identity::{ApprovalStatusUpdate, IdentityService, StaticIdentityService};
pub use invoker::{
    HandlerRegistry, HandlerRequest, HandlerServiceInvoker, ServiceInvoker, StepHandler,
    APPROVAL_STATUS_HANDLER, NOOP_HANDLER,
};
pub use notification::{LogNotificationService, NotificationService, SentNotification};
