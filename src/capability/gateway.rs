//! Capability gateway: module-scoped permission checks.
//!
//! A module may only perform a privileged call (file, network, command
//! execution, model access, audio) if it declared the permission AND neither
//! the host policy nor a per-module override blocks it. Checks are
//! synchronous and side-effect free.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::module::ModuleDescriptor;
use crate::types::{Error, Result};

/// Privileged operations a module may request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    FileAccess,
    NetworkAccess,
    CommandExecution,
    ModelAccess,
    AudioOutput,
    AudioInput,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::FileAccess,
        Permission::NetworkAccess,
        Permission::CommandExecution,
        Permission::ModelAccess,
        Permission::AudioOutput,
        Permission::AudioInput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::FileAccess => "file_access",
            Permission::NetworkAccess => "network_access",
            Permission::CommandExecution => "command_execution",
            Permission::ModelAccess => "model_access",
            Permission::AudioOutput => "audio_output",
            Permission::AudioInput => "audio_input",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Host-wide permission policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HostPolicy {
    /// Permissions no module may use.
    pub blocked_permissions: BTreeSet<Permission>,
    /// module name → override.
    pub module_overrides: BTreeMap<String, ModulePolicy>,
}

/// Per-module policy override.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ModulePolicy {
    /// Permissions denied to this module even if declared.
    pub deny: BTreeSet<Permission>,
}

impl HostPolicy {
    pub fn block(mut self, permission: Permission) -> Self {
        self.blocked_permissions.insert(permission);
        self
    }

    pub fn deny_for(mut self, module: &str, permission: Permission) -> Self {
        self.module_overrides
            .entry(module.to_string())
            .or_default()
            .deny
            .insert(permission);
        self
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Why a permission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotDeclared,
    BlockedByHost,
    BlockedByOverride,
    NotGranted,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::NotDeclared => "not declared by module",
            DenyReason::BlockedByHost => "blocked by host policy",
            DenyReason::BlockedByOverride => "blocked by module policy override",
            DenyReason::NotGranted => "not in the instance grant",
        };
        f.write_str(s)
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_granted(self) -> bool {
        self == Decision::Granted
    }
}

/// Permission tags approved for one module instance.
///
/// Computed once at initialization; replaced (never mutated) on reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionGrant {
    permissions: BTreeSet<Permission>,
    pub granted_at: DateTime<Utc>,
}

impl PermissionGrant {
    pub fn empty() -> Self {
        Self {
            permissions: BTreeSet::new(),
            granted_at: Utc::now(),
        }
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn permissions(&self) -> impl Iterator<Item = Permission> + '_ {
        self.permissions.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Validates permission requests against declared grants and host policy.
#[derive(Debug, Default)]
pub struct CapabilityGateway {
    policy: HostPolicy,
}

impl CapabilityGateway {
    pub fn new(policy: HostPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &HostPolicy {
        &self.policy
    }

    /// Decide whether `descriptor` may use `permission`.
    pub fn authorize(&self, descriptor: &ModuleDescriptor, permission: Permission) -> Decision {
        if !descriptor.declares_permission(permission) {
            return Decision::Denied(DenyReason::NotDeclared);
        }
        if self.policy.blocked_permissions.contains(&permission) {
            return Decision::Denied(DenyReason::BlockedByHost);
        }
        let overridden = self
            .policy
            .module_overrides
            .get(&descriptor.name)
            .map_or(false, |o| o.deny.contains(&permission));
        if overridden {
            return Decision::Denied(DenyReason::BlockedByOverride);
        }
        Decision::Granted
    }

    /// `authorize`, surfacing a denial as `Error::PermissionDenied`.
    pub fn require(&self, descriptor: &ModuleDescriptor, permission: Permission) -> Result<()> {
        match self.authorize(descriptor, permission) {
            Decision::Granted => Ok(()),
            Decision::Denied(reason) => Err(denied(&descriptor.name, permission, reason)),
        }
    }

    /// Authorize every declared permission; the first denial aborts.
    pub fn grant_for(&self, descriptor: &ModuleDescriptor) -> Result<PermissionGrant> {
        let mut permissions = BTreeSet::new();
        for permission in descriptor.permissions.iter().copied() {
            self.require(descriptor, permission)?;
            permissions.insert(permission);
        }
        Ok(PermissionGrant {
            permissions,
            granted_at: Utc::now(),
        })
    }
}

/// Build the PermissionError surfaced to callers.
pub(crate) fn denied(module: &str, permission: Permission, reason: DenyReason) -> Error {
    Error::permission_denied(format!(
        "module '{}' may not use {}: {}",
        module, permission, reason
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleManifest;
    use proptest::prelude::*;

    fn descriptor(name: &str, permissions: &[Permission]) -> ModuleDescriptor {
        let mut manifest = ModuleManifest::new(name, "1.0.0");
        for p in permissions {
            manifest = manifest.with_permission(*p);
        }
        manifest.into_descriptor("mem").unwrap()
    }

    #[test]
    fn test_declared_permission_granted() {
        let gateway = CapabilityGateway::default();
        let d = descriptor("files", &[Permission::FileAccess]);
        assert_eq!(gateway.authorize(&d, Permission::FileAccess), Decision::Granted);
        assert_eq!(
            gateway.authorize(&d, Permission::NetworkAccess),
            Decision::Denied(DenyReason::NotDeclared)
        );
    }

    #[test]
    fn test_host_block_and_override() {
        let gateway = CapabilityGateway::new(
            HostPolicy::default()
                .block(Permission::CommandExecution)
                .deny_for("files", Permission::NetworkAccess),
        );
        let d = descriptor(
            "files",
            &[Permission::CommandExecution, Permission::NetworkAccess, Permission::FileAccess],
        );

        assert_eq!(
            gateway.authorize(&d, Permission::CommandExecution),
            Decision::Denied(DenyReason::BlockedByHost)
        );
        assert_eq!(
            gateway.authorize(&d, Permission::NetworkAccess),
            Decision::Denied(DenyReason::BlockedByOverride)
        );
        assert!(gateway.authorize(&d, Permission::FileAccess).is_granted());

        // Override is scoped to the named module
        let other = descriptor("other", &[Permission::NetworkAccess]);
        assert!(gateway.authorize(&other, Permission::NetworkAccess).is_granted());
    }

    #[test]
    fn test_require_surfaces_permission_error() {
        let gateway = CapabilityGateway::default();
        let d = descriptor("quiet", &[]);
        let err = gateway.require(&d, Permission::AudioOutput).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert!(err.to_string().contains("audio_output"));
    }

    #[test]
    fn test_grant_for() {
        let gateway = CapabilityGateway::default();
        let d = descriptor("m", &[Permission::ModelAccess, Permission::FileAccess]);
        let grant = gateway.grant_for(&d).unwrap();
        assert_eq!(grant.len(), 2);
        assert!(grant.contains(Permission::ModelAccess));
        assert!(!grant.contains(Permission::AudioInput));

        let blocked = CapabilityGateway::new(HostPolicy::default().block(Permission::ModelAccess));
        assert!(blocked.grant_for(&d).is_err());
    }

    proptest! {
        #[test]
        fn prop_undeclared_is_always_denied(
            declared in proptest::sample::subsequence(Permission::ALL.to_vec(), 0..=6),
            requested in proptest::sample::select(Permission::ALL.to_vec()),
        ) {
            let gateway = CapabilityGateway::default();
            let d = descriptor("prop", &declared);
            let decision = gateway.authorize(&d, requested);
            if declared.contains(&requested) {
                prop_assert_eq!(decision, Decision::Granted);
            } else {
                prop_assert_eq!(decision, Decision::Denied(DenyReason::NotDeclared));
            }
        }
    }
}
