//! Module descriptors: manifest parsing and validation.
//!
//! A `ModuleManifest` is the raw, serde-shaped `module.json`. Validation turns
//! it into an immutable `ModuleDescriptor`; re-discovery of a newer version
//! produces a new descriptor instead of mutating the old one.

use std::collections::{BTreeMap, BTreeSet};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::Permission;
use crate::types::{Error, Result};
use crate::validation::validate_identifier;

/// Manifest file name inside a module directory.
pub const MANIFEST_FILE: &str = "module.json";

/// Version of this host, matched against `host_version` requirements.
pub fn host_version() -> Version {
    Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0))
}

// =============================================================================
// Declared tags
// =============================================================================

/// Capability tags a module declares about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Registers commands.
    CommandProvider,
    /// Subscribes to events.
    EventSubscriber,
    /// Runs a background hook while Running.
    BackgroundWorker,
}

/// Per-module concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Handlers may run concurrently.
    #[default]
    Reentrant,
    /// Handler executions are serialized through a per-module queue.
    SingleFlight,
}

/// A command declared in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema the invocation arguments must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_schema: Option<Value>,
}

// =============================================================================
// Manifest (raw)
// =============================================================================

/// Raw `module.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Factory key; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_version: Option<String>,
    /// Other modules this one needs Running: name → semver requirement.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub concurrency: ConcurrencyMode,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// Default configuration, overlaid by the host's per-module config file.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModuleManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            entry: None,
            capabilities: Vec::new(),
            permissions: Vec::new(),
            host_version: None,
            dependencies: BTreeMap::new(),
            concurrency: ConcurrencyMode::Reentrant,
            commands: Vec::new(),
            config: Map::new(),
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        if !self.permissions.contains(&permission) {
            self.permissions.push(permission);
        }
        self
    }

    /// Declare a command; implies `command_provider`.
    pub fn with_command(mut self, name: impl Into<String>, args_schema: Option<Value>) -> Self {
        self.commands.push(CommandSpec {
            name: name.into(),
            description: String::new(),
            args_schema,
        });
        self.with_capability(Capability::CommandProvider)
    }

    pub fn with_dependency(mut self, name: impl Into<String>, req: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), req.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn single_flight(mut self) -> Self {
        self.concurrency = ConcurrencyMode::SingleFlight;
        self
    }

    /// Validate into a descriptor located at `location`.
    pub fn into_descriptor(self, location: impl Into<String>) -> Result<ModuleDescriptor> {
        ModuleDescriptor::from_manifest(self, location.into())
    }
}

// =============================================================================
// Descriptor (validated)
// =============================================================================

/// Validated, immutable module metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: Version,
    pub description: String,
    pub entry: String,
    pub capabilities: BTreeSet<Capability>,
    pub permissions: BTreeSet<Permission>,
    pub host_version: Option<VersionReq>,
    pub dependencies: BTreeMap<String, VersionReq>,
    pub concurrency: ConcurrencyMode,
    pub commands: Vec<CommandSpec>,
    pub config: Map<String, Value>,
    /// Where the manifest was found.
    pub location: String,
}

impl ModuleDescriptor {
    /// Parse and validate a manifest document.
    pub fn parse(raw: &str, location: impl Into<String>) -> Result<Self> {
        let manifest: ModuleManifest = serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("malformed manifest: {}", e)))?;
        Self::from_manifest(manifest, location.into())
    }

    /// Validate a manifest. All problems are collected into one error.
    pub fn from_manifest(manifest: ModuleManifest, location: String) -> Result<Self> {
        let mut problems: Vec<String> = Vec::new();

        if let Err(e) = validate_identifier(&manifest.name, "module name") {
            problems.push(e.to_string());
        }

        let version = match Version::parse(&manifest.version) {
            Ok(v) => Some(v),
            Err(e) => {
                problems.push(format!("invalid version '{}': {}", manifest.version, e));
                None
            }
        };

        let host_version = match manifest.host_version.as_deref().map(VersionReq::parse) {
            None => None,
            Some(Ok(req)) => {
                let host = host_version();
                if !req.matches(&host) {
                    problems.push(format!("requires host {} but host is {}", req, host));
                }
                Some(req)
            }
            Some(Err(e)) => {
                problems.push(format!("invalid host_version requirement: {}", e));
                None
            }
        };

        let mut dependencies = BTreeMap::new();
        for (dep, raw_req) in &manifest.dependencies {
            if dep == &manifest.name {
                problems.push("module cannot depend on itself".to_string());
                continue;
            }
            match VersionReq::parse(raw_req) {
                Ok(req) => {
                    dependencies.insert(dep.clone(), req);
                }
                Err(e) => problems.push(format!("invalid requirement for '{}': {}", dep, e)),
            }
        }

        let capabilities: BTreeSet<Capability> = manifest.capabilities.iter().copied().collect();
        if !manifest.commands.is_empty() && !capabilities.contains(&Capability::CommandProvider) {
            problems.push("declares commands without the command_provider capability".to_string());
        }

        let mut seen = BTreeSet::new();
        for spec in &manifest.commands {
            if let Err(e) = validate_identifier(&spec.name, "command name") {
                problems.push(e.to_string());
            }
            if !seen.insert(spec.name.as_str()) {
                problems.push(format!("command '{}' declared twice", spec.name));
            }
            if let Some(schema) = &spec.args_schema {
                if let Err(e) = jsonschema::validator_for(schema) {
                    problems.push(format!("invalid args_schema for '{}': {}", spec.name, e));
                }
            }
        }

        let version = match version {
            Some(v) if problems.is_empty() => v,
            _ => return Err(Error::validation(problems.join("; "))),
        };

        let entry = manifest.entry.unwrap_or_else(|| manifest.name.clone());
        Ok(Self {
            name: manifest.name,
            version,
            description: manifest.description,
            entry,
            capabilities,
            permissions: manifest.permissions.into_iter().collect(),
            host_version,
            dependencies,
            concurrency: manifest.concurrency,
            commands: manifest.commands,
            config: manifest.config,
            location,
        })
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn declares_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn command_spec(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn is_single_flight(&self) -> bool {
        self.concurrency == ConcurrencyMode::SingleFlight
    }

    /// `name@version`, used in logs and audit entries.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_manifest() {
        let raw = json!({
            "name": "weather",
            "version": "1.2.0",
            "description": "forecasts",
            "capabilities": ["command_provider", "event_subscriber"],
            "permissions": ["network_access"],
            "dependencies": { "geo": "^1" },
            "concurrency": "single_flight",
            "commands": [
                { "name": "weather.now", "args_schema": { "type": "object", "required": ["city"] } }
            ],
            "config": { "units": "metric" }
        })
        .to_string();

        let d = ModuleDescriptor::parse(&raw, "plugins/weather").unwrap();
        assert_eq!(d.name, "weather");
        assert_eq!(d.version, Version::new(1, 2, 0));
        assert_eq!(d.entry, "weather");
        assert!(d.has_capability(Capability::CommandProvider));
        assert!(d.declares_permission(Permission::NetworkAccess));
        assert!(!d.declares_permission(Permission::FileAccess));
        assert!(d.is_single_flight());
        assert!(d.command_spec("weather.now").unwrap().args_schema.is_some());
        assert_eq!(d.config["units"], "metric");
        assert_eq!(d.label(), "weather@1.2.0");
    }

    #[test]
    fn test_malformed_json() {
        let err = ModuleDescriptor::parse("{ not json", "x").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("malformed manifest"));
    }

    #[test]
    fn test_unknown_permission_tag_rejected() {
        let raw = r#"{"name":"x","version":"1.0.0","permissions":["root_access"]}"#;
        assert!(ModuleDescriptor::parse(raw, "x").is_err());
    }

    #[test]
    fn test_collects_all_problems() {
        let manifest = ModuleManifest {
            commands: vec![CommandSpec {
                name: "Bad Name".to_string(),
                description: String::new(),
                args_schema: None,
            }],
            ..ModuleManifest::new("Weather", "one")
        };

        let err = manifest.into_descriptor("mem").unwrap_err().to_string();
        assert!(err.contains("module name"));
        assert!(err.contains("invalid version"));
        assert!(err.contains("command_provider"));
        assert!(err.contains("command name"));
    }

    #[test]
    fn test_host_version_requirement() {
        let ok = ModuleManifest {
            host_version: Some(format!("={}", env!("CARGO_PKG_VERSION"))),
            ..ModuleManifest::new("a", "1.0.0")
        };
        assert!(ok.into_descriptor("mem").is_ok());

        let too_new = ModuleManifest {
            host_version: Some(">=99.0.0".to_string()),
            ..ModuleManifest::new("a", "1.0.0")
        };
        let err = too_new.into_descriptor("mem").unwrap_err();
        assert!(err.to_string().contains("requires host"));
    }

    #[test]
    fn test_invalid_args_schema() {
        let manifest = ModuleManifest::new("a", "1.0.0")
            .with_command("a.run", Some(json!({ "type": 12 })));
        let err = manifest.into_descriptor("mem").unwrap_err();
        assert!(err.to_string().contains("invalid args_schema"));
    }

    #[test]
    fn test_duplicate_command_and_self_dependency() {
        let manifest = ModuleManifest::new("a", "1.0.0")
            .with_command("a.run", None)
            .with_command("a.run", None)
            .with_dependency("a", "^1");
        let err = manifest.into_descriptor("mem").unwrap_err().to_string();
        assert!(err.contains("declared twice"));
        assert!(err.contains("depend on itself"));
    }

    #[test]
    fn test_builder_defaults() {
        let d = ModuleManifest::new("echo", "0.1.0")
            .with_entry("builtin.echo")
            .with_command("echo.say", None)
            .into_descriptor("builtin")
            .unwrap();
        assert_eq!(d.entry, "builtin.echo");
        assert_eq!(d.concurrency, ConcurrencyMode::Reentrant);
        assert!(d.has_capability(Capability::CommandProvider));
    }
}
