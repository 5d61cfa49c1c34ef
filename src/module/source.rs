//! Module sources: where manifests are discovered.
//!
//! A source never fails as a whole because of one bad module: each location
//! yields either a validated descriptor or a rejection record.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::module::descriptor::{ModuleDescriptor, ModuleManifest, MANIFEST_FILE};

/// A manifest that failed to parse or validate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedModule {
    pub location: String,
    /// Name from the manifest, when it could be read.
    pub name: Option<String>,
    pub error: String,
}

/// Outcome of scanning one location.
#[derive(Debug, Clone)]
pub enum DiscoveredModule {
    Valid(ModuleDescriptor),
    Rejected(RejectedModule),
}

/// Produces module descriptors from some backing store.
pub trait ModuleSource: Send + Sync + std::fmt::Debug {
    /// Human-readable source label.
    fn label(&self) -> String;

    fn scan(&self) -> Vec<DiscoveredModule>;
}

// =============================================================================
// Directory source
// =============================================================================

/// Scans `<root>/*/module.json`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_one(dir: &Path) -> Option<DiscoveredModule> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return None;
        }
        let location = dir.display().to_string();
        let raw = match std::fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(e) => {
                return Some(DiscoveredModule::Rejected(RejectedModule {
                    location,
                    name: None,
                    error: format!("unreadable manifest: {}", e),
                }))
            }
        };
        Some(match ModuleDescriptor::parse(&raw, location.clone()) {
            Ok(descriptor) => DiscoveredModule::Valid(descriptor),
            Err(e) => DiscoveredModule::Rejected(RejectedModule {
                location,
                name: manifest_name(&raw),
                error: e.to_string(),
            }),
        })
    }
}

/// Best-effort name extraction from a manifest that failed validation.
fn manifest_name(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("name")?.as_str().map(str::to_string)
}

impl ModuleSource for DirectorySource {
    fn label(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    fn scan(&self) -> Vec<DiscoveredModule> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "module_dir_unreadable");
                return Vec::new();
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        // Deterministic discovery order
        dirs.sort();

        dirs.iter().filter_map(|dir| Self::read_one(dir)).collect()
    }
}

// =============================================================================
// Memory source
// =============================================================================

/// In-memory manifests. Clones share the same backing list, so a test or
/// host can publish a new version after the runtime was built.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    label: String,
    manifests: Arc<RwLock<Vec<ModuleManifest>>>,
}

impl MemorySource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            manifests: Arc::default(),
        }
    }

    pub fn with_manifest(self, manifest: ModuleManifest) -> Self {
        self.insert(manifest);
        self
    }

    /// Add a manifest. Manifests with the same name and version are replaced.
    pub fn insert(&self, manifest: ModuleManifest) {
        let mut manifests = self
            .manifests
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        manifests.retain(|m| !(m.name == manifest.name && m.version == manifest.version));
        manifests.push(manifest);
    }

    pub fn len(&self) -> usize {
        self.manifests
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleSource for MemorySource {
    fn label(&self) -> String {
        format!("memory:{}", self.label)
    }

    fn scan(&self) -> Vec<DiscoveredModule> {
        let manifests = self
            .manifests
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        manifests
            .into_iter()
            .map(|manifest| {
                let location = format!("memory:{}/{}", self.label, manifest.name);
                let name = manifest.name.clone();
                match manifest.into_descriptor(location.clone()) {
                    Ok(descriptor) => DiscoveredModule::Valid(descriptor),
                    Err(e) => DiscoveredModule::Rejected(RejectedModule {
                        location,
                        name: Some(name),
                        error: e.to_string(),
                    }),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(root: &Path, dir: &str, body: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn test_directory_scan_mixes_valid_and_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "a-weather", r#"{"name":"weather","version":"1.0.0"}"#);
        write_manifest(tmp.path(), "b-broken", r#"{"name":"broken","version":"nope"}"#);
        write_manifest(tmp.path(), "c-garbage", "{{{");
        std::fs::create_dir_all(tmp.path().join("d-empty")).unwrap();

        let found = DirectorySource::new(tmp.path()).scan();
        assert_eq!(found.len(), 3);

        assert!(matches!(&found[0], DiscoveredModule::Valid(d) if d.name == "weather"));
        match &found[1] {
            DiscoveredModule::Rejected(r) => {
                assert_eq!(r.name.as_deref(), Some("broken"));
                assert!(r.error.contains("invalid version"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(matches!(&found[2], DiscoveredModule::Rejected(r) if r.name.is_none()));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let source = DirectorySource::new("/definitely/not/here");
        assert!(source.scan().is_empty());
    }

    #[test]
    fn test_memory_source_shared_between_clones() {
        let source = MemorySource::new("test");
        let handle = source.clone();
        handle.insert(ModuleManifest::new("echo", "1.0.0"));
        handle.insert(ModuleManifest::new("echo", "1.0.0"));
        handle.insert(ModuleManifest::new("echo", "2.0.0"));

        assert_eq!(source.len(), 2);
        let found = source.scan();
        assert!(found.iter().all(|d| matches!(d, DiscoveredModule::Valid(_))));
    }
}
