//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use crate::kernel::types::AdminStatus;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the agent runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed module metadata or invalid arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown module, command or subscription.
    #[error("not found: {0}")]
    NotFound(String),

    /// A command name is already owned by another running module.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Requested capability was not granted.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A command or event handler failed; the caller may continue.
    #[error("handler error: {0}")]
    Handler(String),

    /// A handler failed in a way that terminates the calling task.
    #[error("unrecoverable handler error: {0}")]
    Unrecoverable(String),

    /// A bounded operation exceeded its budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Monitor-detected stall.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// Cooperative cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Target module is quarantined or no longer accepting calls.
    #[error("quarantined: {0}")]
    Quarantined(String),

    /// Invalid lifecycle transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Administrative request for a state the module is already in.
    #[error("already in state: {0}")]
    AlreadyInState(String),

    /// Host worker pool exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code (audit log, CLI output).
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::DuplicateName(_) => "DUPLICATE_NAME",
            Error::PermissionDenied(_) => "PERMISSION_ERROR",
            Error::Handler(_) => "HANDLER_ERROR",
            Error::Unrecoverable(_) => "UNRECOVERABLE",
            Error::Timeout(_) => "TIMEOUT",
            Error::Deadlock(_) => "DEADLOCK",
            Error::Cancelled(_) => "CANCELLED",
            Error::Quarantined(_) => "QUARANTINED",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::AlreadyInState(_) => "ALREADY_IN_STATE",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// Whether this failure is charged to the owning module's health counters.
    pub fn counts_against_health(&self) -> bool {
        matches!(
            self,
            Error::Handler(_) | Error::Unrecoverable(_) | Error::Timeout(_)
        )
    }

    /// Map onto the administrative status set.
    pub fn admin_status(&self) -> AdminStatus {
        match self {
            Error::NotFound(_) => AdminStatus::NotFound,
            Error::PermissionDenied(_) => AdminStatus::PermissionError,
            Error::Timeout(_) => AdminStatus::Timeout,
            Error::AlreadyInState(_) => AdminStatus::AlreadyInState,
            Error::Validation(_) | Error::StateTransition(_) => AdminStatus::Invalid,
            _ => AdminStatus::Quarantined,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn duplicate_name(msg: impl Into<String>) -> Self {
        Self::DuplicateName(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn deadlock(msg: impl Into<String>) -> Self {
        Self::Deadlock(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn quarantined(msg: impl Into<String>) -> Self {
        Self::Quarantined(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn already_in_state(msg: impl Into<String>) -> Self {
        Self::AlreadyInState(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
