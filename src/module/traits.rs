//! The fixed interface every module implements, and the factories that
//! produce module instances from a descriptor's `entry` key.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::commbus::{CommandHandler, Event, EventHandler};
use crate::module::context::ModuleContext;
use crate::module::descriptor::ModuleDescriptor;
use crate::types::{Error, Result};

/// Failure returned by module code.
#[derive(thiserror::Error, Debug)]
pub enum ModuleError {
    /// Recoverable: the caller sees a HandlerError and may continue.
    #[error("{0}")]
    Failed(String),

    /// Unrecoverable: terminates the calling task.
    #[error("{0}")]
    Fatal(String),

    /// A runtime error bubbled up from a facade or registry call.
    #[error(transparent)]
    Runtime(#[from] Error),
}

impl ModuleError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl From<ModuleError> for Error {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::Failed(msg) => Error::handler(msg),
            ModuleError::Fatal(msg) => Error::unrecoverable(msg),
            ModuleError::Runtime(e) => e,
        }
    }
}

/// Module result type.
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Lifecycle hooks and handlers of an extension module.
///
/// Methods take `&self`; modules keep mutable state behind their own
/// synchronization. A module that needs the facade or store from inside a
/// handler keeps a clone of the context passed to `initialize`.
#[async_trait]
pub trait Module: Send + Sync {
    /// Called once per instance, bounded by the lifecycle timeout. Commands
    /// and subscriptions made through `ctx` belong to this instance.
    async fn initialize(&self, ctx: &ModuleContext) -> ModuleResult<()>;

    /// Called on unload and before a reload, bounded by the lifecycle timeout.
    async fn shutdown(&self) -> ModuleResult<()> {
        Ok(())
    }

    /// Handle a command registered by this module.
    async fn handle_command(&self, command: &str, args: Value) -> ModuleResult<Value> {
        let _ = args;
        Err(ModuleError::failed(format!("command '{}' not supported", command)))
    }

    /// Handle an event this module subscribed to.
    async fn handle_event(&self, event: &Event) -> ModuleResult<()> {
        let _ = event;
        Ok(())
    }

    /// Long-running hook for `background_worker` modules. Must return once
    /// `cancel` fires.
    async fn run_background(&self, ctx: ModuleContext, cancel: CancellationToken) -> ModuleResult<()> {
        let _ = ctx;
        cancel.cancelled().await;
        Ok(())
    }
}

// =============================================================================
// Handler adapters
// =============================================================================

/// Routes a registered command to `Module::handle_command`.
///
/// Holds the module weakly; the lifecycle manager owns it.
pub(crate) struct ModuleCommandHandler {
    pub(crate) module: Weak<dyn Module>,
}

#[async_trait]
impl CommandHandler for ModuleCommandHandler {
    async fn call(&self, command: &str, args: Value) -> Result<Value> {
        let module = self
            .module
            .upgrade()
            .ok_or_else(|| Error::not_found(format!("owner of '{}' was released", command)))?;
        module.handle_command(command, args).await.map_err(Error::from)
    }
}

/// Routes a delivered event to `Module::handle_event`.
pub(crate) struct ModuleEventHandler {
    pub(crate) module: Weak<dyn Module>,
}

#[async_trait]
impl EventHandler for ModuleEventHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let module = self
            .module
            .upgrade()
            .ok_or_else(|| Error::not_found(format!("subscriber of '{}' was released", event.name)))?;
        module.handle_event(event).await.map_err(Error::from)
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Produces a module instance for a descriptor.
pub trait ModuleFactory: Send + Sync {
    fn create(&self, descriptor: &ModuleDescriptor) -> ModuleResult<Arc<dyn Module>>;
}

struct FnFactory<F>(F);

impl<F, M> ModuleFactory for FnFactory<F>
where
    F: Fn(&ModuleDescriptor) -> M + Send + Sync,
    M: Module + 'static,
{
    fn create(&self, descriptor: &ModuleDescriptor) -> ModuleResult<Arc<dyn Module>> {
        Ok(Arc::new((self.0)(descriptor)))
    }
}

/// Entry key → factory.
#[derive(Clone, Default)]
pub struct ModuleFactories {
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl std::fmt::Debug for ModuleFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("ModuleFactories").field("entries", &keys).finish()
    }
}

impl ModuleFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: impl Into<String>, factory: Arc<dyn ModuleFactory>) {
        self.factories.insert(entry.into(), factory);
    }

    /// Register a plain constructor.
    pub fn register_fn<F, M>(&mut self, entry: impl Into<String>, f: F)
    where
        F: Fn(&ModuleDescriptor) -> M + Send + Sync + 'static,
        M: Module + 'static,
    {
        self.register(entry, Arc::new(FnFactory(f)));
    }

    pub fn get(&self, entry: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories.get(entry).cloned()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }
}
