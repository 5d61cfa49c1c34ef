//! Kernel types: ModuleState, administrative status, module listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Permission;
use crate::kernel::health::HealthSnapshot;
use crate::types::{Error, ModuleId};

/// Module instance lifecycle state.
///
/// State transitions:
/// ```text
/// DISCOVERED → VALIDATED → LOADING → INITIALIZING → RUNNING
///                             ↓            ↓          ↓
///                        QUARANTINED ← ────┴── RELOADING → INITIALIZING
///                             ↓                   ↑
///                             ├───────────────────┘
///                             ↓
///                         UNLOADING → UNLOADED
/// ```
/// RUNNING may also go to UNLOADING or QUARANTINED directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Discovered,
    Validated,
    Loading,
    Initializing,
    Running,
    Reloading,
    Quarantined,
    Unloading,
    Unloaded,
}

impl ModuleState {
    /// Unloaded is terminal; the instance id is retired.
    pub fn is_terminal(self) -> bool {
        self == ModuleState::Unloaded
    }

    /// Whether an explicit `unload` may start from this state.
    pub fn can_unload(self) -> bool {
        matches!(self, ModuleState::Running | ModuleState::Quarantined)
    }

    /// Whether an explicit `reload` may start from this state.
    pub fn can_reload(self) -> bool {
        matches!(self, ModuleState::Running | ModuleState::Quarantined)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ModuleState) -> bool {
        use ModuleState::*;
        match (self, to) {
            (Discovered, Validated) => true,
            (Validated, Loading) => true,
            // Permission denial lands the instance in quarantine
            (Loading, Initializing) | (Loading, Quarantined) => true,
            (Initializing, Running) | (Initializing, Quarantined) => true,
            (Running, Reloading) | (Running, Quarantined) | (Running, Unloading) => true,
            (Reloading, Initializing) | (Reloading, Quarantined) => true,
            // Quarantine is left only by explicit reload or unload
            (Quarantined, Reloading) | (Quarantined, Unloading) => true,
            (Unloading, Unloaded) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Discovered => "discovered",
            ModuleState::Validated => "validated",
            ModuleState::Loading => "loading",
            ModuleState::Initializing => "initializing",
            ModuleState::Running => "running",
            ModuleState::Reloading => "reloading",
            ModuleState::Quarantined => "quarantined",
            ModuleState::Unloading => "unloading",
            ModuleState::Unloaded => "unloaded",
        }
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured status returned by every administrative call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    Ok,
    AlreadyInState,
    PermissionError,
    Timeout,
    NotFound,
    /// The operation failed and left the module quarantined.
    Quarantined,
    /// The request was rejected before touching the module.
    Invalid,
}

/// Result of `load_module`, `reload_module` or `unload_module`.
#[derive(Debug, Clone, Serialize)]
pub struct AdminOutcome {
    pub status: AdminStatus,
    pub module: String,
    /// Module state after the call; `None` if the module is unknown or not loaded.
    pub state: Option<ModuleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AdminOutcome {
    pub fn ok(module: &str, state: Option<ModuleState>) -> Self {
        Self {
            status: AdminStatus::Ok,
            module: module.to_string(),
            state,
            message: None,
        }
    }

    pub fn from_error(module: &str, err: &Error, state: Option<ModuleState>) -> Self {
        Self {
            status: err.admin_status(),
            module: module.to_string(),
            state,
            message: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AdminStatus::Ok
    }
}

/// One row of `list_modules`.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    /// Descriptor version; `None` for a manifest that failed validation.
    pub version: Option<String>,
    pub location: String,
    /// False when the manifest failed validation; see `validation_error`.
    pub validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    pub state: ModuleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<ModuleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_upgrade: Option<String>,
    pub commands: Vec<String>,
    pub subscriptions: usize,
    /// Permissions granted to the current instance.
    pub granted: Vec<Permission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_since: Option<DateTime<Utc>>,
}
