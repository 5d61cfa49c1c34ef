//! Extension modules: metadata, discovery, the module interface, and the
//! per-instance resources (context, private store, configuration overlay).

mod config;
mod context;
mod descriptor;
mod registry;
mod source;
mod store;
pub mod testing;
mod traits;

pub use config::ModuleConfig;
pub use context::ModuleContext;
pub use descriptor::{
    host_version, Capability, CommandSpec, ConcurrencyMode, ModuleDescriptor, ModuleManifest,
    MANIFEST_FILE,
};
pub use registry::{DiscoveryReport, ModuleRegistry, RegistryEntry};
pub use source::{DirectorySource, DiscoveredModule, MemorySource, ModuleSource, RejectedModule};
pub use store::ModuleStore;
pub use traits::{Module, ModuleError, ModuleFactories, ModuleFactory, ModuleResult};
