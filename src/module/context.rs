//! Handle given to a module instance for talking to the runtime.
//!
//! Every registration made through a context is owned by the instance that
//! received it, so unloading or quarantining the instance removes it.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::capability::Facade;
use crate::commbus::{
    CommandHandler, CommandRegistry, DeliveryReport, Event, EventBus, EventHandler, OwnerRef,
};
use crate::module::config::ModuleConfig;
use crate::module::descriptor::{Capability, ModuleDescriptor};
use crate::module::store::ModuleStore;
use crate::module::traits::{Module, ModuleCommandHandler, ModuleEventHandler};
use crate::types::{Error, ModuleId, Result, SubscriptionId};

/// Runtime handle for one module instance.
#[derive(Clone)]
pub struct ModuleContext {
    owner: OwnerRef,
    descriptor: Arc<ModuleDescriptor>,
    module: Weak<dyn Module>,
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    facade: Facade,
    store: Arc<ModuleStore>,
    config: Arc<ModuleConfig>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module", &self.descriptor.label())
            .field("module_id", self.owner.id())
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        owner: OwnerRef,
        descriptor: Arc<ModuleDescriptor>,
        module: Weak<dyn Module>,
        commands: Arc<CommandRegistry>,
        events: Arc<EventBus>,
        facade: Facade,
        store: Arc<ModuleStore>,
        config: Arc<ModuleConfig>,
    ) -> Self {
        Self {
            owner,
            descriptor,
            module,
            commands,
            events,
            facade,
            store,
            config,
        }
    }

    pub fn module_id(&self) -> &ModuleId {
        self.owner.id()
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub(crate) fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    fn require_capability(&self, capability: Capability, action: &str) -> Result<()> {
        if !self.descriptor.has_capability(capability) {
            return Err(Error::permission_denied(format!(
                "module '{}' cannot {} without the {:?} capability",
                self.descriptor.name, action, capability
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Register `name`, routed to `Module::handle_command`. The manifest's
    /// `args_schema` for `name`, if any, is enforced on every call.
    pub async fn register_command(&self, name: &str) -> Result<()> {
        let handler: Arc<dyn CommandHandler> = Arc::new(ModuleCommandHandler {
            module: self.module.clone(),
        });
        self.register_handler(name, handler).await
    }

    /// Register `name` with an explicit handler instead of `handle_command`.
    pub async fn register_handler(&self, name: &str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        self.require_capability(Capability::CommandProvider, "register commands")?;
        match self
            .descriptor
            .command_spec(name)
            .and_then(|spec| spec.args_schema.as_ref())
        {
            Some(schema) => {
                self.commands
                    .register_with_schema(&self.owner, name, handler, schema)
                    .await
            }
            None => self.commands.register(&self.owner, name, handler).await,
        }
    }

    pub async fn unregister_command(&self, name: &str) -> Result<()> {
        self.commands.unregister(self.owner.id(), name).await
    }

    /// Invoke another module's command.
    pub async fn invoke(&self, command: &str, args: Value) -> Result<Value> {
        self.commands.invoke(command, args).await
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Subscribe to `event`, routed to `Module::handle_event`.
    pub async fn subscribe(&self, event: &str) -> Result<SubscriptionId> {
        let handler: Arc<dyn EventHandler> = Arc::new(ModuleEventHandler {
            module: self.module.clone(),
        });
        self.subscribe_with(event, handler).await
    }

    /// Subscribe with an explicit handler.
    pub async fn subscribe_with(&self, event: &str, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId> {
        self.require_capability(Capability::EventSubscriber, "subscribe to events")?;
        self.events.subscribe(&self.owner, event, handler).await
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.events.unsubscribe(id).await
    }

    pub async fn publish(&self, event: &str, payload: Value) -> DeliveryReport {
        self.events
            .publish(Event::new(event, payload, self.descriptor.name.clone()))
            .await
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Capability-gated access to external collaborators.
    pub fn facade(&self) -> &Facade {
        &self.facade
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }
}
