//! Module lifecycle management.
//!
//! Drives each module instance through its state machine:
//! VALIDATED → LOADING → INITIALIZING → RUNNING → {RELOADING, QUARANTINED, UNLOADING → UNLOADED}
//!
//! Administrative operations on one module are serialized by a per-module
//! admin lock; operations on different modules proceed independently. The
//! instance table lock is only held for short bookkeeping sections, never
//! across module code.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityGateway, Collaborators, Facade, Permission, PermissionGrant};
use crate::commbus::{CommandRegistry, EventBus, OwnerRef};
use crate::kernel::audit::{AuditKind, AuditLog, AuditScope};
use crate::kernel::health::{HealthSnapshot, ModuleHealth};
use crate::kernel::recovery::{with_recovery, with_recovery_async};
use crate::kernel::types::{ModuleInfo, ModuleState};
use crate::module::{
    Capability, DiscoveryReport, Module, ModuleConfig, ModuleContext, ModuleDescriptor,
    ModuleFactories, ModuleRegistry, ModuleStore,
};
use crate::types::{Error, ModuleId, PathsConfig, Result, TimeoutConfig};

// =============================================================================
// Instance record
// =============================================================================

struct Background {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runtime record of one loaded descriptor. Owned exclusively by the
/// lifecycle manager; registries only ever see the `OwnerRef`.
struct ModuleInstance {
    id: ModuleId,
    descriptor: Arc<ModuleDescriptor>,
    state: ModuleState,
    state_since: DateTime<Utc>,
    health: Arc<ModuleHealth>,
    owner: Option<OwnerRef>,
    grant: Option<Arc<PermissionGrant>>,
    module: Option<Arc<dyn Module>>,
    store: Option<Arc<ModuleStore>>,
    config: Option<Arc<ModuleConfig>>,
    background: Option<Background>,
    last_error: Option<String>,
    load_order: u64,
}

impl ModuleInstance {
    fn new(descriptor: Arc<ModuleDescriptor>, load_order: u64) -> Self {
        Self {
            id: ModuleId::new(),
            descriptor,
            state: ModuleState::Validated,
            state_since: Utc::now(),
            health: Arc::new(ModuleHealth::new()),
            owner: None,
            grant: None,
            module: None,
            store: None,
            config: None,
            background: None,
            last_error: None,
            load_order,
        }
    }
}

/// Everything a successful initialize produced.
struct Started {
    health: Arc<ModuleHealth>,
    owner: OwnerRef,
    grant: Arc<PermissionGrant>,
    module: Arc<dyn Module>,
    store: Arc<ModuleStore>,
    config: Arc<ModuleConfig>,
    ctx: ModuleContext,
}

/// Resources detached from an instance for teardown.
struct Detached {
    id: ModuleId,
    owner: Option<OwnerRef>,
    module: Option<Arc<dyn Module>>,
    store: Option<Arc<ModuleStore>>,
    background: Option<Background>,
}

/// Monitor-facing view of a running module.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub module: String,
    pub module_id: ModuleId,
    pub consecutive_failures: u32,
}

// =============================================================================
// Lifecycle manager
// =============================================================================

/// Owns the module registry and every module instance.
pub struct LifecycleManager {
    registry: RwLock<ModuleRegistry>,
    instances: RwLock<HashMap<String, ModuleInstance>>,
    admin_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    factories: ModuleFactories,
    gateway: Arc<CapabilityGateway>,
    collaborators: Arc<Collaborators>,
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    audit: Arc<AuditLog>,
    timeouts: TimeoutConfig,
    paths: PathsConfig,
    failure_threshold: u32,
    load_seq: AtomicU64,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("factories", &self.factories)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

/// Construction inputs for `LifecycleManager`.
#[derive(Debug)]
pub struct LifecycleDeps {
    pub registry: ModuleRegistry,
    pub factories: ModuleFactories,
    pub gateway: Arc<CapabilityGateway>,
    pub collaborators: Arc<Collaborators>,
    pub commands: Arc<CommandRegistry>,
    pub events: Arc<EventBus>,
    pub audit: Arc<AuditLog>,
    pub timeouts: TimeoutConfig,
    pub paths: PathsConfig,
    pub failure_threshold: u32,
}

impl LifecycleManager {
    pub fn new(deps: LifecycleDeps) -> Self {
        Self {
            registry: RwLock::new(deps.registry),
            instances: RwLock::new(HashMap::new()),
            admin_locks: std::sync::Mutex::new(HashMap::new()),
            factories: deps.factories,
            gateway: deps.gateway,
            collaborators: deps.collaborators,
            commands: deps.commands,
            events: deps.events,
            audit: deps.audit,
            timeouts: deps.timeouts,
            paths: deps.paths,
            failure_threshold: deps.failure_threshold,
            load_seq: AtomicU64::new(0),
        }
    }

    fn admin_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.admin_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Rescan every module source. Modules with a live, non-quarantined
    /// instance get newer versions queued as pending upgrades.
    pub async fn discover(&self) -> DiscoveryReport {
        let live: HashSet<String> = self
            .instances
            .read()
            .await
            .iter()
            .filter(|(_, inst)| inst.state != ModuleState::Quarantined)
            .map(|(name, _)| name.clone())
            .collect();

        let report = self.registry.write().await.discover(&live);
        for rejected in &report.rejected {
            let scope = match &rejected.name {
                Some(name) => AuditScope {
                    module: Some(name.clone()),
                    ..AuditScope::none()
                },
                None => AuditScope::none(),
            };
            self.audit.record(
                scope,
                AuditKind::DiscoveryRejected {
                    location: rejected.location.clone(),
                    error: rejected.error.clone(),
                },
            );
        }
        report
    }

    pub async fn descriptor(&self, name: &str) -> Result<Arc<ModuleDescriptor>> {
        self.registry.read().await.get(name)
    }

    pub async fn descriptors(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.registry.read().await.list()
    }

    // =========================================================================
    // State bookkeeping
    // =========================================================================

    pub async fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.instances.read().await.get(name).map(|inst| inst.state)
    }

    pub async fn instance_id(&self, name: &str) -> Option<ModuleId> {
        self.instances.read().await.get(name).map(|inst| inst.id.clone())
    }

    /// Apply a validated transition and audit it.
    async fn set_state(&self, name: &str, to: ModuleState, reason: Option<String>) -> Result<()> {
        let mut instances = self.instances.write().await;
        let inst = instances
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("module '{}' is not loaded", name)))?;
        let from = inst.state;
        if !from.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "module '{}' cannot go from {} to {}",
                name, from, to
            )));
        }
        inst.state = to;
        inst.state_since = Utc::now();
        if to == ModuleState::Quarantined {
            inst.last_error = reason.clone();
        }
        let scope = AuditScope::module(&inst.id, name);
        drop(instances);

        tracing::info!(module = name, from = %from, to = %to, reason = ?reason, "module_transition");
        self.audit.record(scope, AuditKind::Transition { from, to, reason });
        Ok(())
    }

    /// Detach the resources an instance holds so they can be torn down
    /// without the table lock.
    async fn detach(&self, name: &str) -> Option<Detached> {
        let mut instances = self.instances.write().await;
        let inst = instances.get_mut(name)?;
        Some(Detached {
            id: inst.id.clone(),
            owner: inst.owner.clone(),
            module: inst.module.take(),
            store: inst.store.take(),
            background: inst.background.take(),
        })
    }

    async fn stop_background(&self, name: &str, background: Option<Background>) {
        let Some(background) = background else {
            return;
        };
        background.cancel.cancel();
        let mut handle = background.handle;
        if tokio::time::timeout(self.timeouts.lifecycle, &mut handle).await.is_err() {
            tracing::warn!(module = name, "background_stop_timeout");
            handle.abort();
        }
    }

    /// Unregister everything, stop background work, run shutdown (bounded)
    /// and close the store. Returns the shutdown outcome.
    async fn teardown(&self, name: &str) -> Result<()> {
        let Some(detached) = self.detach(name).await else {
            return Ok(());
        };
        if let Some(owner) = &detached.owner {
            owner.revoke();
        }
        self.stop_background(name, detached.background).await;

        let commands = self.commands.unregister_module(&detached.id).await;
        let subscriptions = self.events.unsubscribe_module(&detached.id).await;
        tracing::debug!(module = name, commands = commands.len(), subscriptions, "module_unregistered");

        let shutdown = match detached.module {
            Some(module) => {
                let outcome = tokio::time::timeout(
                    self.timeouts.lifecycle,
                    with_recovery_async(
                        async { module.shutdown().await.map_err(Error::from) },
                        "shutdown",
                    ),
                )
                .await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "shutdown of '{}' exceeded {:?}",
                        name, self.timeouts.lifecycle
                    ))),
                }
            }
            None => Ok(()),
        };

        if let Some(store) = detached.store {
            if let Err(e) = store.close().await {
                tracing::warn!(module = name, error = %e, "store_close_failed");
            }
        }
        shutdown
    }

    /// Move an instance that failed while loading or reloading into
    /// quarantine. Partial registrations have already been revoked.
    async fn fail_to_quarantine(&self, name: &str, err: &Error) {
        let reason = err.to_string();
        tracing::warn!(module = name, error = %err, code = err.code(), "module_quarantined");
        if let Err(e) = self
            .set_state(name, ModuleState::Quarantined, Some(reason.clone()))
            .await
        {
            tracing::error!(module = name, error = %e, "quarantine_transition_failed");
        }
        if let Some(id) = self.instance_id(name).await {
            self.audit
                .record(AuditScope::module(&id, name), AuditKind::Quarantined { reason });
        }
    }

    // =========================================================================
    // Start-up path shared by load and reload
    // =========================================================================

    async fn check_dependencies(&self, descriptor: &ModuleDescriptor) -> Result<()> {
        let instances = self.instances.read().await;
        for (dep, req) in &descriptor.dependencies {
            match instances.get(dep) {
                Some(inst) if inst.state == ModuleState::Running && req.matches(&inst.descriptor.version) => {}
                Some(inst) if inst.state == ModuleState::Running => {
                    return Err(Error::validation(format!(
                        "'{}' requires {} {} but {} is running",
                        descriptor.name,
                        dep,
                        req,
                        inst.descriptor.version
                    )));
                }
                _ => {
                    return Err(Error::validation(format!(
                        "'{}' requires {} {} to be running",
                        descriptor.name, dep, req
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create the module, its private resources and context, then run
    /// `initialize` within the lifecycle budget. On failure everything the
    /// attempt registered is revoked before returning.
    async fn start(&self, id: &ModuleId, descriptor: &Arc<ModuleDescriptor>) -> Result<Started> {
        let name = descriptor.name.as_str();
        let grant = Arc::new(self.gateway.grant_for(descriptor)?);

        let factory = self.factories.get(&descriptor.entry).ok_or_else(|| {
            Error::handler(format!(
                "no module factory registered for entry '{}'",
                descriptor.entry
            ))
        })?;
        let module = with_recovery(
            || factory.create(descriptor).map_err(Error::from),
            "module factory",
        )?;

        let store = Arc::new(ModuleStore::open(&self.paths.data_dir, name).await?);
        let config = match ModuleConfig::load(&self.paths.config_dir, descriptor).await {
            Ok(config) => Arc::new(config),
            Err(e) => {
                let _ = store.close().await;
                return Err(e);
            }
        };

        let health = Arc::new(ModuleHealth::new());
        let owner = OwnerRef::new(id.clone(), name, descriptor.is_single_flight(), health.clone());
        let facade = Facade::new(
            id.clone(),
            descriptor.clone(),
            grant.clone(),
            self.gateway.clone(),
            self.collaborators.clone(),
            self.audit.clone(),
        );
        let ctx = ModuleContext::new(
            owner.clone(),
            descriptor.clone(),
            Arc::downgrade(&module),
            self.commands.clone(),
            self.events.clone(),
            facade,
            store.clone(),
            config.clone(),
        );

        let initialized = self.initialize(&module, &ctx).await;
        if let Err(e) = initialized {
            owner.revoke();
            self.commands.revoke_module(id).await;
            self.events.revoke_module(id).await;
            if let Err(close_err) = store.close().await {
                tracing::warn!(module = name, error = %close_err, "store_close_failed");
            }
            return Err(e);
        }

        Ok(Started {
            health,
            owner,
            grant,
            module,
            store,
            config,
            ctx,
        })
    }

    async fn initialize(&self, module: &Arc<dyn Module>, ctx: &ModuleContext) -> Result<()> {
        let name = ctx.name();
        let outcome = tokio::time::timeout(
            self.timeouts.lifecycle,
            with_recovery_async(
                async { module.initialize(ctx).await.map_err(Error::from) },
                "initialize",
            ),
        )
        .await;
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::timeout(format!(
                    "initialize of '{}' exceeded {:?}",
                    name, self.timeouts.lifecycle
                )))
            }
        }

        // Declared commands the module did not register itself route to
        // `handle_command`.
        for spec in &ctx.descriptor().commands {
            if self.commands.owner_of(&spec.name).await.as_ref() != Some(ctx.module_id()) {
                ctx.register_command(&spec.name).await?;
            }
        }
        Ok(())
    }

    fn spawn_background(&self, started: &Started) -> Option<Background> {
        if !started.ctx.descriptor().has_capability(Capability::BackgroundWorker) {
            return None;
        }
        let cancel = CancellationToken::new();
        let module = started.module.clone();
        let ctx = started.ctx.clone();
        let owner = started.owner.clone();
        let audit = self.audit.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let name = ctx.name().to_string();
            let id = ctx.module_id().clone();
            let result = with_recovery_async(
                async { module.run_background(ctx, token).await.map_err(Error::from) },
                "background",
            )
            .await;
            if let Err(e) = result {
                let consecutive = owner.health().record_failure(&e);
                tracing::warn!(module = %name, error = %e, consecutive = ?consecutive, "background_failed");
                audit.record(
                    AuditScope::module(&id, &name),
                    AuditKind::BackgroundFailed { error: e.to_string() },
                );
            }
        });
        Some(Background { cancel, handle })
    }

    /// Record a successful start and move the instance to Running.
    async fn commit_started(&self, name: &str, started: Started) -> Result<ModuleState> {
        let background = self.spawn_background(&started);
        {
            let mut instances = self.instances.write().await;
            let inst = instances
                .get_mut(name)
                .ok_or_else(|| Error::internal(format!("instance '{}' vanished", name)))?;
            inst.health = started.health;
            inst.owner = Some(started.owner);
            inst.grant = Some(started.grant);
            inst.module = Some(started.module);
            inst.store = Some(started.store);
            inst.config = Some(started.config);
            inst.background = background;
            inst.last_error = None;
        }
        self.set_state(name, ModuleState::Running, None).await?;
        Ok(ModuleState::Running)
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    /// Load and initialize `name`.
    pub async fn load(&self, name: &str) -> Result<ModuleState> {
        let lock = self.admin_lock(name);
        let _guard = lock.lock().await;

        match self.state_of(name).await {
            Some(ModuleState::Running) => {
                return Err(Error::already_in_state(format!("module '{}' is already running", name)))
            }
            Some(ModuleState::Quarantined) => {
                return Err(Error::state_transition(format!(
                    "module '{}' is quarantined; reload or unload it",
                    name
                )))
            }
            Some(state) => {
                return Err(Error::state_transition(format!(
                    "module '{}' is {}",
                    name, state
                )))
            }
            None => {}
        }

        let descriptor = self.registry.write().await.promote_pending(name)?;
        self.check_dependencies(&descriptor).await?;

        let instance = ModuleInstance::new(descriptor.clone(), self.load_seq.fetch_add(1, Ordering::Relaxed));
        let id = instance.id.clone();
        tracing::info!(module = name, module_id = %id, version = %descriptor.version, "module_loading");
        self.instances.write().await.insert(name.to_string(), instance);

        self.set_state(name, ModuleState::Loading, None).await?;
        if let Err(e) = self.gateway.grant_for(&descriptor) {
            self.fail_to_quarantine(name, &e).await;
            return Err(e);
        }
        self.set_state(name, ModuleState::Initializing, None).await?;

        match self.start(&id, &descriptor).await {
            Ok(started) => self.commit_started(name, started).await,
            Err(e) => {
                self.fail_to_quarantine(name, &e).await;
                Err(e)
            }
        }
    }

    /// Tear down and re-initialize `name` against the newest descriptor.
    ///
    /// Commands of the module are parked for the duration so callers block
    /// (up to `reload_wait`) instead of seeing NotFound. A failure at any
    /// step leaves the instance Quarantined; there is no rollback.
    pub async fn reload(&self, name: &str) -> Result<ModuleState> {
        let lock = self.admin_lock(name);
        let _guard = lock.lock().await;

        let current = self
            .instances
            .read()
            .await
            .get(name)
            .map(|inst| (inst.id.clone(), inst.state));
        let Some((id, state)) = current else {
            self.registry.read().await.get(name)?;
            return Err(Error::state_transition(format!("module '{}' is not loaded", name)));
        };
        if !state.can_reload() {
            return Err(Error::state_transition(format!(
                "module '{}' cannot reload while {}",
                name, state
            )));
        }

        let ticket = self.commands.park_module(&id).await;
        let result = self.reload_locked(name, &id).await;
        self.commands.unpark(ticket).await;
        result
    }

    async fn reload_locked(&self, name: &str, id: &ModuleId) -> Result<ModuleState> {
        self.set_state(name, ModuleState::Reloading, None).await?;

        let result = async {
            self.teardown(name).await?;
            let descriptor = self.registry.write().await.promote_pending(name)?;
            self.check_dependencies(&descriptor).await?;
            if let Some(inst) = self.instances.write().await.get_mut(name) {
                inst.descriptor = descriptor.clone();
            }
            self.gateway.grant_for(&descriptor)?;
            self.set_state(name, ModuleState::Initializing, None).await?;
            tracing::info!(module = name, module_id = %id, version = %descriptor.version, "module_reinitializing");
            self.start(id, &descriptor).await
        }
        .await;

        match result {
            Ok(started) => self.commit_started(name, started).await,
            Err(e) => {
                self.fail_to_quarantine(name, &e).await;
                Err(e)
            }
        }
    }

    /// Unregister, shut down and retire `name`.
    ///
    /// The instance reaches Unloaded even when shutdown fails or times out;
    /// that failure is returned after the fact.
    pub async fn unload(&self, name: &str) -> Result<ModuleState> {
        let lock = self.admin_lock(name);
        let _guard = lock.lock().await;

        let state = match self.state_of(name).await {
            Some(state) => state,
            None => {
                self.registry.read().await.get(name)?;
                return Err(Error::already_in_state(format!("module '{}' is not loaded", name)));
            }
        };
        if !state.can_unload() {
            return Err(Error::state_transition(format!(
                "module '{}' cannot unload while {}",
                name, state
            )));
        }

        self.set_state(name, ModuleState::Unloading, None).await?;
        let shutdown = self.teardown(name).await;
        let reason = shutdown.as_ref().err().map(|e| e.to_string());
        self.set_state(name, ModuleState::Unloaded, reason).await?;
        self.instances.write().await.remove(name);

        match shutdown {
            Ok(()) => Ok(ModuleState::Unloaded),
            Err(e) => {
                tracing::warn!(module = name, error = %e, "module_shutdown_failed");
                Err(e)
            }
        }
    }

    /// Force a Running module into quarantine without waiting on in-flight
    /// calls. Returns false if the module is not Running or an administrative
    /// operation currently holds it.
    pub async fn quarantine(&self, name: &str, reason: &str) -> bool {
        let lock = self.admin_lock(name);
        let Ok(_guard) = lock.try_lock() else {
            return false;
        };

        let (id, owner, background) = {
            let mut instances = self.instances.write().await;
            let Some(inst) = instances.get_mut(name) else {
                return false;
            };
            if inst.state != ModuleState::Running {
                return false;
            }
            (inst.id.clone(), inst.owner.clone(), inst.background.take())
        };

        if let Some(owner) = owner {
            owner.revoke();
        }
        if let Some(background) = background {
            background.cancel.cancel();
        }
        let commands = self.commands.revoke_module(&id).await;
        let subscriptions = self.events.revoke_module(&id).await;
        tracing::warn!(
            module = name,
            module_id = %id,
            commands = commands.len(),
            subscriptions,
            reason,
            "module_quarantined"
        );

        if let Err(e) = self
            .set_state(name, ModuleState::Quarantined, Some(reason.to_string()))
            .await
        {
            tracing::error!(module = name, error = %e, "quarantine_transition_failed");
            return false;
        }
        self.audit.record(
            AuditScope::module(&id, name),
            AuditKind::Quarantined {
                reason: reason.to_string(),
            },
        );
        true
    }

    /// Load every validated module that is not loaded yet, dependencies
    /// first. Modules whose dependencies never come up are still attempted
    /// so their failure is reported.
    pub async fn load_all(&self) -> Vec<(String, Result<ModuleState>)> {
        let loaded: HashSet<String> = self.instances.read().await.keys().cloned().collect();
        let mut pending: Vec<Arc<ModuleDescriptor>> = self
            .descriptors()
            .await
            .into_iter()
            .filter(|d| !loaded.contains(&d.name))
            .collect();

        let mut results = Vec::new();
        loop {
            let running: HashSet<String> = self
                .instances
                .read()
                .await
                .iter()
                .filter(|(_, inst)| inst.state == ModuleState::Running)
                .map(|(name, _)| name.clone())
                .collect();
            let (ready, blocked): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|d| d.dependencies.keys().all(|dep| running.contains(dep)));
            pending = blocked;
            if ready.is_empty() {
                break;
            }
            for descriptor in ready {
                let result = self.load(&descriptor.name).await;
                results.push((descriptor.name.clone(), result));
            }
        }
        for descriptor in pending {
            let result = self.load(&descriptor.name).await;
            results.push((descriptor.name.clone(), result));
        }
        results
    }

    /// Unload every instance in reverse load order.
    pub async fn shutdown_all(&self) -> Vec<(String, Result<ModuleState>)> {
        let mut order: Vec<(u64, String)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(name, inst)| (inst.load_order, name.clone()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0));

        let mut results = Vec::with_capacity(order.len());
        for (_, name) in order {
            let result = self.unload(&name).await;
            results.push((name, result));
        }
        results
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Consecutive-failure counters of every Running module.
    pub async fn health_samples(&self) -> Vec<HealthSample> {
        self.instances
            .read()
            .await
            .iter()
            .filter(|(_, inst)| inst.state == ModuleState::Running)
            .map(|(name, inst)| HealthSample {
                module: name.clone(),
                module_id: inst.id.clone(),
                consecutive_failures: inst.health.consecutive_failures(),
            })
            .collect()
    }

    /// Resolved configuration overlay of a loaded module.
    pub async fn module_config(&self, name: &str) -> Option<Arc<ModuleConfig>> {
        self.instances.read().await.get(name)?.config.clone()
    }

    pub async fn health(&self, name: &str) -> Option<HealthSnapshot> {
        self.instances
            .read()
            .await
            .get(name)
            .map(|inst| inst.health.snapshot(self.failure_threshold))
    }

    /// Every known module: loaded instances, validated descriptors and
    /// rejected manifests, ordered by name.
    pub async fn list(&self) -> Vec<ModuleInfo> {
        let (descriptors, rejected, pending) = {
            let registry = self.registry.read().await;
            let descriptors = registry.list();
            let pending: HashMap<String, String> = descriptors
                .iter()
                .filter_map(|d| {
                    registry
                        .pending_upgrade(&d.name)
                        .map(|v| (d.name.clone(), v.to_string()))
                })
                .collect();
            (descriptors, registry.rejected().to_vec(), pending)
        };

        struct Row {
            id: ModuleId,
            version: String,
            location: String,
            state: ModuleState,
            state_since: DateTime<Utc>,
            health: HealthSnapshot,
            last_error: Option<String>,
            granted: Vec<Permission>,
        }
        let rows: HashMap<String, Row> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(name, inst)| {
                (
                    name.clone(),
                    Row {
                        id: inst.id.clone(),
                        version: inst.descriptor.version.to_string(),
                        location: inst.descriptor.location.clone(),
                        state: inst.state,
                        state_since: inst.state_since,
                        health: inst.health.snapshot(self.failure_threshold),
                        last_error: inst.last_error.clone(),
                        granted: inst
                            .grant
                            .as_ref()
                            .map(|g| g.permissions().collect())
                            .unwrap_or_default(),
                    },
                )
            })
            .collect();

        let mut infos = Vec::with_capacity(descriptors.len() + rejected.len());
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            let info = match rows.get(&name) {
                Some(row) => ModuleInfo {
                    name: name.clone(),
                    version: Some(row.version.clone()),
                    location: row.location.clone(),
                    validated: true,
                    validation_error: None,
                    state: row.state,
                    instance_id: Some(row.id.clone()),
                    pending_upgrade: pending.get(&name).cloned(),
                    commands: self.commands.commands_for(&row.id).await,
                    subscriptions: self.events.subscriptions_for(&row.id).await,
                    granted: row.granted.clone(),
                    health: Some(row.health.clone()),
                    last_error: row.last_error.clone(),
                    state_since: Some(row.state_since),
                },
                None => ModuleInfo {
                    name: name.clone(),
                    version: Some(descriptor.version.to_string()),
                    location: descriptor.location.clone(),
                    validated: true,
                    validation_error: None,
                    state: ModuleState::Validated,
                    instance_id: None,
                    pending_upgrade: pending.get(&name).cloned(),
                    commands: Vec::new(),
                    subscriptions: 0,
                    granted: Vec::new(),
                    health: None,
                    last_error: None,
                    state_since: None,
                },
            };
            infos.push(info);
        }
        for reject in rejected {
            infos.push(ModuleInfo {
                name: reject.name.clone().unwrap_or_else(|| reject.location.clone()),
                version: None,
                location: reject.location.clone(),
                validated: false,
                validation_error: Some(reject.error.clone()),
                state: ModuleState::Discovered,
                instance_id: None,
                pending_upgrade: None,
                commands: Vec::new(),
                subscriptions: 0,
                granted: Vec::new(),
                health: None,
                last_error: None,
                state_since: None,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
