//! Module registry: metadata for every discovered module, independent of
//! load state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use semver::Version;
use serde::Serialize;

use crate::module::descriptor::ModuleDescriptor;
use crate::module::source::{DiscoveredModule, ModuleSource, RejectedModule};
use crate::types::{Error, Result};

/// Registry row for one module name.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Descriptor used by the next load.
    pub descriptor: Arc<ModuleDescriptor>,
    /// Newer version found while the current one was running.
    pub pending_upgrade: Option<Arc<ModuleDescriptor>>,
}

/// What one `discover` pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    /// Names seen for the first time.
    pub added: Vec<String>,
    /// Names whose descriptor was replaced by a higher version.
    pub superseded: Vec<String>,
    /// Names with a higher version queued behind a running instance.
    pub pending_upgrade: Vec<String>,
    pub rejected: Vec<RejectedModule>,
}

/// Discovered module metadata.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    sources: Vec<Box<dyn ModuleSource>>,
    entries: BTreeMap<String, RegistryEntry>,
    rejected: Vec<RejectedModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: Box<dyn ModuleSource>) {
        tracing::debug!(source = %source.label(), "module_source_added");
        self.sources.push(source);
    }

    /// Scan every source.
    ///
    /// A higher version replaces the current descriptor unless the module is
    /// in `running`, in which case it is queued as pending upgrade. Equal or
    /// lower versions are ignored.
    pub fn discover(&mut self, running: &HashSet<String>) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut found: Vec<ModuleDescriptor> = Vec::new();

        for source in &self.sources {
            for discovered in source.scan() {
                match discovered {
                    DiscoveredModule::Valid(descriptor) => found.push(descriptor),
                    DiscoveredModule::Rejected(rejected) => {
                        tracing::warn!(
                            location = %rejected.location,
                            error = %rejected.error,
                            "module_rejected"
                        );
                        report.rejected.push(rejected);
                    }
                }
            }
        }

        for descriptor in found {
            let name = descriptor.name.clone();
            match self.offer(descriptor, running.contains(&name)) {
                Offer::Added => report.added.push(name),
                Offer::Superseded => report.superseded.push(name),
                Offer::Pending => report.pending_upgrade.push(name),
                Offer::Ignored => {}
            }
        }

        // Deduplicate names that improved more than once in a pass
        for list in [&mut report.added, &mut report.superseded, &mut report.pending_upgrade] {
            list.sort();
            list.dedup();
        }
        // A name both added and superseded in one pass is just added
        report.superseded.retain(|n| !report.added.contains(n));

        self.rejected = report.rejected.clone();
        tracing::info!(
            added = report.added.len(),
            superseded = report.superseded.len(),
            pending = report.pending_upgrade.len(),
            rejected = report.rejected.len(),
            "discovery_completed"
        );
        report
    }

    /// Insert a descriptor directly (same rules as discovery).
    pub fn insert(&mut self, descriptor: ModuleDescriptor, running: bool) {
        self.offer(descriptor, running);
    }

    fn offer(&mut self, descriptor: ModuleDescriptor, running: bool) -> Offer {
        let Some(entry) = self.entries.get_mut(&descriptor.name) else {
            self.entries.insert(
                descriptor.name.clone(),
                RegistryEntry {
                    descriptor: Arc::new(descriptor),
                    pending_upgrade: None,
                },
            );
            return Offer::Added;
        };

        if descriptor.version <= entry.descriptor.version {
            return Offer::Ignored;
        }
        if running {
            let better = entry
                .pending_upgrade
                .as_ref()
                .map_or(true, |p| descriptor.version > p.version);
            if !better {
                return Offer::Ignored;
            }
            tracing::info!(module = %descriptor.name, version = %descriptor.version, "upgrade_pending");
            entry.pending_upgrade = Some(Arc::new(descriptor));
            return Offer::Pending;
        }

        tracing::info!(
            module = %descriptor.name,
            from = %entry.descriptor.version,
            to = %descriptor.version,
            "descriptor_superseded"
        );
        entry.descriptor = Arc::new(descriptor);
        entry.pending_upgrade = None;
        Offer::Superseded
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModuleDescriptor>> {
        self.entries
            .get(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| Error::not_found(format!("module '{}' is not known", name)))
    }

    pub fn entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Descriptors ordered by name.
    pub fn list(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.entries.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn pending_upgrade(&self, name: &str) -> Option<Version> {
        self.entries
            .get(name)?
            .pending_upgrade
            .as_ref()
            .map(|d| d.version.clone())
    }

    /// Make the pending upgrade (if any) the current descriptor and return
    /// the current descriptor.
    pub fn promote_pending(&mut self, name: &str) -> Result<Arc<ModuleDescriptor>> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("module '{}' is not known", name)))?;
        if let Some(next) = entry.pending_upgrade.take() {
            tracing::info!(
                module = %name,
                from = %entry.descriptor.version,
                to = %next.version,
                "upgrade_promoted"
            );
            entry.descriptor = next;
        }
        Ok(entry.descriptor.clone())
    }

    /// Manifests rejected by the last discovery pass.
    pub fn rejected(&self) -> &[RejectedModule] {
        &self.rejected
    }
}

enum Offer {
    Added,
    Superseded,
    Pending,
    Ignored,
}
