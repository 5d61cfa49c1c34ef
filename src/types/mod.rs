//! Core types for the agent runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ModuleId, TaskId, SubscriptionId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for paths, timeouts, monitor and policy

mod config;
mod errors;
mod ids;

pub use config::{
    AuditConfig, Config, DispatcherConfig, MonitorConfig, ObservabilityConfig, PathsConfig,
    TimeoutConfig,
};
pub use errors::{Error, Result};
pub use ids::{ModuleId, SubscriptionId, TaskId};
