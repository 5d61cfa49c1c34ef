//! Scripted modules for tests and smoke runs.
//!
//! A `ScriptedModule` behaves according to a `ModuleScript` and reports what
//! happened to it through a shared `ModuleProbe`, which survives reloads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::commbus::Event;
use crate::module::context::ModuleContext;
use crate::module::descriptor::{Capability, ModuleManifest};
use crate::module::traits::{Module, ModuleError, ModuleResult};

/// What a scripted command does when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return a fixed value.
    Reply(Value),
    /// Return the arguments unchanged.
    Echo,
    /// Return `{"module": name, "version": version}` of the serving instance.
    Version,
    /// Recoverable failure.
    Fail(String),
    /// Unrecoverable failure.
    Fatal(String),
    /// Panic inside the handler.
    Panic,
    /// Never return.
    Hang,
}

/// Behavior of a `ScriptedModule`.
#[derive(Debug, Clone, Default)]
pub struct ModuleScript {
    commands: BTreeMap<String, Behavior>,
    events: Vec<String>,
    failing_events: Vec<String>,
    handler_delay: Option<Duration>,
    init_delay: Option<Duration>,
    init_error: Option<String>,
    shutdown_delay: Option<Duration>,
    background: bool,
}

impl ModuleScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, name: impl Into<String>, behavior: Behavior) -> Self {
        self.commands.insert(name.into(), behavior);
        self
    }

    /// Subscribe to `event` during initialize.
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    /// Subscribe to `event` and fail every delivery.
    pub fn failing_event(mut self, event: impl Into<String>) -> Self {
        let event = event.into();
        self.events.push(event.clone());
        self.failing_events.push(event);
        self
    }

    /// Sleep this long inside every command handler.
    pub fn handler_delay(mut self, delay: Duration) -> Self {
        self.handler_delay = Some(delay);
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn init_error(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    pub fn shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = Some(delay);
        self
    }

    /// Run a ticking background hook.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Manifest declaring everything this script uses.
    pub fn manifest(&self, name: &str, version: &str) -> ModuleManifest {
        let mut manifest = ModuleManifest::new(name, version);
        for command in self.commands.keys() {
            manifest = manifest.with_command(command.clone(), None);
        }
        if !self.events.is_empty() {
            manifest = manifest.with_capability(Capability::EventSubscriber);
        }
        if self.background {
            manifest = manifest.with_capability(Capability::BackgroundWorker);
        }
        manifest
    }
}

/// Observations shared by every instance built from the same module value.
#[derive(Debug, Clone, Default)]
pub struct ModuleProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    initialized: AtomicUsize,
    shutdowns: AtomicUsize,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    background_ticks: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl ModuleProbe {
    pub fn initialized(&self) -> usize {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping command executions observed.
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    pub fn background_ticks(&self) -> usize {
        self.inner.background_ticks.load(Ordering::SeqCst)
    }

    /// Names of delivered events, in delivery order.
    pub fn events(&self) -> Vec<String> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn enter(&self) {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ActiveCall<'a>(&'a ModuleProbe);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Module driven by a `ModuleScript`.
///
/// Cloning yields a fresh instance sharing the script and probe, which is
/// what a factory closure does on each load or reload.
#[derive(Debug)]
pub struct ScriptedModule {
    script: Arc<ModuleScript>,
    probe: ModuleProbe,
    ctx: Mutex<Option<ModuleContext>>,
}

impl Clone for ScriptedModule {
    fn clone(&self) -> Self {
        Self {
            script: self.script.clone(),
            probe: self.probe.clone(),
            ctx: Mutex::new(None),
        }
    }
}

impl ScriptedModule {
    pub fn new(script: ModuleScript) -> Self {
        Self {
            script: Arc::new(script),
            probe: ModuleProbe::default(),
            ctx: Mutex::new(None),
        }
    }

    pub fn probe(&self) -> ModuleProbe {
        self.probe.clone()
    }

    fn context(&self) -> Option<ModuleContext> {
        self.ctx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Module for ScriptedModule {
    async fn initialize(&self, ctx: &ModuleContext) -> ModuleResult<()> {
        if let Some(delay) = self.script.init_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.script.init_error {
            return Err(ModuleError::failed(message.clone()));
        }
        for command in self.script.commands.keys() {
            ctx.register_command(command).await?;
        }
        for event in &self.script.events {
            ctx.subscribe(event).await?;
        }
        *self.ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ctx.clone());
        self.probe.inner.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> ModuleResult<()> {
        if let Some(delay) = self.script.shutdown_delay {
            tokio::time::sleep(delay).await;
        }
        self.probe.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[allow(clippy::panic)]
    async fn handle_command(&self, command: &str, args: Value) -> ModuleResult<Value> {
        let behavior = self
            .script
            .commands
            .get(command)
            .cloned()
            .ok_or_else(|| ModuleError::failed(format!("unscripted command '{}'", command)))?;

        self.probe.enter();
        let _active = ActiveCall(&self.probe);
        if let Some(delay) = self.script.handler_delay {
            tokio::time::sleep(delay).await;
        }

        match behavior {
            Behavior::Reply(value) => Ok(value),
            Behavior::Echo => Ok(args),
            Behavior::Version => {
                let ctx = self
                    .context()
                    .ok_or_else(|| ModuleError::failed("not initialized"))?;
                Ok(json!({
                    "module": ctx.name(),
                    "version": ctx.descriptor().version.to_string(),
                }))
            }
            Behavior::Fail(message) => Err(ModuleError::failed(message)),
            Behavior::Fatal(message) => Err(ModuleError::fatal(message)),
            Behavior::Panic => panic!("scripted panic in '{}'", command),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        }
    }

    async fn handle_event(&self, event: &Event) -> ModuleResult<()> {
        self.probe
            .inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.name.clone());
        if self.script.failing_events.contains(&event.name) {
            return Err(ModuleError::failed(format!("scripted failure on '{}'", event.name)));
        }
        Ok(())
    }

    async fn run_background(&self, _ctx: ModuleContext, cancel: CancellationToken) -> ModuleResult<()> {
        let mut tick = tokio::time::interval(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    self.probe.inner.background_ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}
