//! Kernel - the runtime facade and its subsystems.
//!
//! `Runtime` owns the shared registries and exposes the three host surfaces:
//!   - **Administrative**: list/load/reload/unload modules, structured status
//!   - **Invocation**: `invoke`, `publish`, `subscribe`, task submission
//!   - **Inspection**: audit log, health, statistics, monitor control
//!
//! Subsystems (lifecycle, dispatcher, monitor) are plain structs shared by
//! `Arc`; each serializes its own writes.

pub mod audit;
pub mod dispatcher;
pub mod health;
pub mod lifecycle;
pub mod monitor;
pub mod recovery;
pub mod types;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::capability::{CapabilityGateway, Collaborators};
use crate::commbus::{
    CommandRegistry, CommandStats, DeliveryReport, Event, EventBus, EventHandler, EventStats,
    OwnerRef,
};
use crate::module::{
    DirectorySource, DiscoveryReport, MemorySource, Module, ModuleDescriptor, ModuleFactories,
    ModuleFactory, ModuleManifest, ModuleRegistry, ModuleSource,
};
use crate::types::{Config, Error, Result, SubscriptionId, TaskId};

use self::audit::AuditLog;
use self::dispatcher::{Dispatcher, DispatcherSettings, DispatcherStats, Task, TaskHandle, TaskOutcome, WorkerSnapshot};
use self::health::HealthSnapshot;
use self::lifecycle::{LifecycleDeps, LifecycleManager};
use self::monitor::{Monitor, MonitorReport};
use self::types::{AdminOutcome, ModuleInfo, ModuleState};

// =============================================================================
// Builder
// =============================================================================

/// Assembles a `Runtime` from configuration, module sources and factories.
#[derive(Debug)]
pub struct RuntimeBuilder {
    config: Config,
    factories: ModuleFactories,
    sources: Vec<Box<dyn ModuleSource>>,
    host_manifests: MemorySource,
    collaborators: Collaborators,
    audit: Option<Arc<AuditLog>>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            factories: ModuleFactories::new(),
            sources: Vec::new(),
            host_manifests: MemorySource::new("host"),
            collaborators: Collaborators::default(),
            audit: None,
        }
    }

    /// Register the entry point for manifests whose `entry` is `entry`.
    pub fn with_factory(mut self, entry: impl Into<String>, factory: Arc<dyn ModuleFactory>) -> Self {
        self.factories.register(entry, factory);
        self
    }

    pub fn with_module_fn<F, M>(mut self, entry: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ModuleDescriptor) -> M + Send + Sync + 'static,
        M: Module + 'static,
    {
        self.factories.register_fn(entry, f);
        self
    }

    /// Add a module source scanned on every `discover`.
    pub fn with_source(mut self, source: Box<dyn ModuleSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Make an in-memory manifest discoverable.
    pub fn with_manifest(self, manifest: ModuleManifest) -> Self {
        self.host_manifests.insert(manifest);
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Share an existing audit log instead of building one from config.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let config = self.config;

        let audit = match self.audit {
            Some(audit) => audit,
            None => Arc::new(AuditLog::from_config(&config.audit)?),
        };
        let commands = Arc::new(CommandRegistry::new(config.timeouts.clone(), audit.clone()));
        let events = Arc::new(EventBus::new(config.timeouts.clone(), audit.clone()));
        let gateway = Arc::new(CapabilityGateway::new(config.policy.clone()));

        let mut registry = ModuleRegistry::new();
        for dir in &config.paths.module_dirs {
            registry.add_source(Box::new(DirectorySource::new(dir.clone())));
        }
        if !self.host_manifests.is_empty() {
            registry.add_source(Box::new(self.host_manifests));
        }
        for source in self.sources {
            registry.add_source(source);
        }

        let lifecycle = Arc::new(LifecycleManager::new(LifecycleDeps {
            registry,
            factories: self.factories,
            gateway: gateway.clone(),
            collaborators: Arc::new(self.collaborators),
            commands: commands.clone(),
            events: events.clone(),
            audit: audit.clone(),
            timeouts: config.timeouts.clone(),
            paths: config.paths.clone(),
            failure_threshold: config.monitor.failure_threshold,
        }));

        let dispatcher = Arc::new(Dispatcher::new(
            commands.clone(),
            events.clone(),
            audit.clone(),
            DispatcherSettings {
                task_timeout: config.timeouts.task,
                max_workers: config.dispatcher.max_workers,
            },
        ));

        let monitor = Monitor::new(dispatcher.clone(), lifecycle.clone(), config.monitor.clone());

        Ok(Runtime {
            config: Arc::new(config),
            host: OwnerRef::host(),
            gateway,
            commands,
            events,
            audit,
            lifecycle,
            dispatcher,
            monitor: Arc::new(Mutex::new(monitor)),
            monitor_handle: Arc::new(Mutex::new(None)),
        })
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Combined counters.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub commands: CommandStats,
    pub events: EventStats,
    pub dispatcher: DispatcherStats,
}

/// The extension runtime. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: Arc<Config>,
    host: OwnerRef,
    gateway: Arc<CapabilityGateway>,
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    audit: Arc<AuditLog>,
    lifecycle: Arc<LifecycleManager>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<Mutex<Monitor>>,
    monitor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Administrative surface
    // =========================================================================

    /// Rescan module sources.
    pub async fn discover(&self) -> DiscoveryReport {
        self.lifecycle.discover().await
    }

    pub async fn list_modules(&self) -> Vec<ModuleInfo> {
        self.lifecycle.list().await
    }

    pub async fn load_module(&self, name: &str) -> AdminOutcome {
        let result = self.lifecycle.load(name).await;
        self.outcome(name, result, None).await
    }

    pub async fn reload_module(&self, name: &str) -> AdminOutcome {
        let result = self.lifecycle.reload(name).await;
        self.outcome(name, result, None).await
    }

    /// Unload `name`. A shutdown that times out still completes the unload
    /// and reports `Timeout`.
    pub async fn unload_module(&self, name: &str) -> AdminOutcome {
        let result = self.lifecycle.unload(name).await;
        let completed = match &result {
            Err(Error::Timeout(_)) => Some(ModuleState::Unloaded),
            _ => None,
        };
        self.outcome(name, result, completed).await
    }

    /// Load every validated module in dependency order.
    pub async fn load_all(&self) -> Vec<AdminOutcome> {
        let mut outcomes = Vec::new();
        for (name, result) in self.lifecycle.load_all().await {
            outcomes.push(self.outcome(&name, result, None).await);
        }
        outcomes
    }

    async fn outcome(
        &self,
        name: &str,
        result: Result<ModuleState>,
        state_on_error: Option<ModuleState>,
    ) -> AdminOutcome {
        match result {
            Ok(state) => AdminOutcome::ok(name, Some(state)),
            Err(e) => {
                let state = match state_on_error {
                    Some(state) => Some(state),
                    None => self.lifecycle.state_of(name).await,
                };
                tracing::info!(module = name, code = e.code(), error = %e, "admin_request_failed");
                AdminOutcome::from_error(name, &e, state)
            }
        }
    }

    pub async fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.lifecycle.state_of(name).await
    }

    pub async fn health(&self, name: &str) -> Option<HealthSnapshot> {
        self.lifecycle.health(name).await
    }

    // =========================================================================
    // Invocation surface
    // =========================================================================

    pub async fn invoke(&self, command: &str, args: Value) -> Result<Value> {
        self.commands.invoke(command, args).await
    }

    /// Publish as the host.
    pub async fn publish(&self, event: &str, payload: Value) -> DeliveryReport {
        self.events
            .publish(Event::new(event, payload, self.host.name().to_string()))
            .await
    }

    /// Subscribe a host handler; never revoked by module lifecycle.
    pub async fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId> {
        self.events.subscribe(&self.host, event, handler).await
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.events.unsubscribe(id).await
    }

    pub async fn submit(&self, task: Task) -> Result<TaskHandle> {
        self.dispatcher.submit(task).await
    }

    /// Submit and wait for the outcome.
    pub async fn run_task(&self, task: Task) -> Result<TaskOutcome> {
        self.dispatcher.run(task).await
    }

    pub async fn cancel_task(&self, id: &TaskId) -> bool {
        self.dispatcher.cancel(id).await
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.dispatcher.workers().await
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn gateway(&self) -> &CapabilityGateway {
        &self.gateway
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            commands: self.commands.stats().await,
            events: self.events.stats().await,
            dispatcher: self.dispatcher.stats().await,
        }
    }

    // =========================================================================
    // Monitor
    // =========================================================================

    /// Run one monitor cycle now.
    pub async fn sweep(&self) -> MonitorReport {
        self.monitor.lock().await.run_cycle().await
    }

    /// Start the periodic monitor. No-op if already running.
    pub async fn start_monitor(&self) {
        let mut handle = self.monitor_handle.lock().await;
        if handle.is_some() {
            return;
        }
        *handle = Some(self.monitor.lock().await.start());
    }

    pub async fn stop_monitor(&self) {
        self.monitor.lock().await.stop();
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "monitor_join_failed");
            }
        }
    }

    /// Stop the monitor, cancel in-flight tasks, unload every module in
    /// reverse load order and flush the audit file.
    pub async fn shutdown(&self) -> Vec<AdminOutcome> {
        self.stop_monitor().await;
        let cancelled = self.dispatcher.cancel_all().await;
        if cancelled > 0 {
            tracing::info!(tasks = cancelled, "shutdown_cancelled_tasks");
        }

        let mut outcomes = Vec::new();
        for (name, result) in self.lifecycle.shutdown_all().await {
            let completed = match &result {
                Err(Error::Timeout(_)) => Some(ModuleState::Unloaded),
                _ => None,
            };
            outcomes.push(self.outcome(&name, result, completed).await);
        }
        self.audit.flush().await;
        tracing::info!(modules = outcomes.len(), "runtime_shutdown");
        outcomes
    }
}
