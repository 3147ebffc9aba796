//! Engine Errors
//!
//! A single error type shared by every engine component. Variants mirror
//! the kinds of failure a caller can observe: malformed input, idempotency
//! violations, missing records, illegal state transitions, authorization
//! failures and step dispatch failures.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure raised while performing a step's type-specific action.
///
/// Carries whether the Supervisor may re-attempt the step. The Dispatcher
/// never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DispatchError {
    /// Human-readable failure description, preserved verbatim
    pub message: String,
    /// Whether a retry could plausibly succeed
    pub retryable: bool,
}

impl DispatchError {
    /// A transient failure (network error, timeout, downstream 5xx).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away by trying again.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Errors returned by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("an active instance already exists for business key '{0}'")]
    DuplicateInstance(String),

    #[error("workflow '{name}' version {version} is already registered")]
    DuplicateVersion { name: String, version: u32 },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("execution {0} is not waiting for approval")]
    NotWaiting(Uuid),

    #[error("user '{user}' is not authorized: {reason}")]
    Unauthorized { user: String, reason: String },

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("concurrent modification of {kind} {id}")]
    Conflict { kind: &'static str, id: Uuid },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True for optimistic-concurrency conflicts that callers may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
