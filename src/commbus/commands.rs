//! Command registry: command name → owning module handler.
//!
//! At most one entry per name. Registration is linearizable with respect to
//! `invoke`: a name is visible only once the write lock is released, and
//! `unregister` closes the entry's gate and waits out in-flight calls (up to
//! the grace period) before returning.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};

use crate::commbus::owner::{drain_all, CallBudget, CallGate, CallOutcome, OwnerRef};
use crate::kernel::audit::{AuditKind, AuditLog, AuditScope};
use crate::types::{Error, ModuleId, Result, TaskId, TimeoutConfig};

/// Handler invoked for a registered command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, command: &str, args: Value) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, _command: &str, args: Value) -> Result<Value> {
        (self)(args).await
    }
}

#[derive(Clone)]
struct CommandEntry {
    owner: OwnerRef,
    handler: Arc<dyn CommandHandler>,
    gate: CallGate,
    schema: Option<Arc<jsonschema::Validator>>,
}

impl CommandEntry {
    /// False once unregistration or revocation has started for this row.
    fn is_live(&self) -> bool {
        !self.owner.is_revoked() && !self.gate.is_closed()
    }
}

/// Public view of a registered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub module: String,
    pub module_id: ModuleId,
    pub has_schema: bool,
}

/// Command registry statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CommandStats {
    pub registered: usize,
    pub invocations: u64,
    pub failures: u64,
    pub not_found: u64,
    pub rejected_args: u64,
}

/// Outstanding reload marker for a module's command names.
///
/// While parked, `invoke` on one of these names blocks until the ticket is
/// released (or `reload_wait` elapses) instead of failing with NotFound.
#[derive(Debug)]
pub struct ParkTicket {
    seq: u64,
    names: Vec<String>,
    done: watch::Sender<bool>,
}

/// Command name → handler table.
pub struct CommandRegistry {
    entries: RwLock<HashMap<String, CommandEntry>>,
    parked: RwLock<HashMap<String, (u64, watch::Receiver<bool>)>>,
    park_seq: AtomicU64,
    stats: RwLock<CommandStats>,
    timeouts: TimeoutConfig,
    audit: Arc<AuditLog>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl CommandRegistry {
    pub fn new(timeouts: TimeoutConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            parked: RwLock::new(HashMap::new()),
            park_seq: AtomicU64::new(0),
            stats: RwLock::new(CommandStats::default()),
            timeouts,
            audit,
        }
    }

    fn budget(&self) -> CallBudget {
        CallBudget {
            handler: self.timeouts.handler,
            single_flight_wait: self.timeouts.single_flight_wait,
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register `name` for `owner`. Fails with DuplicateName if any owner
    /// already holds the name.
    pub async fn register(
        &self,
        owner: &OwnerRef,
        name: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        self.insert(owner, name, handler, None).await
    }

    /// Register with an argument schema checked before every call.
    pub async fn register_with_schema(
        &self,
        owner: &OwnerRef,
        name: &str,
        handler: Arc<dyn CommandHandler>,
        args_schema: &Value,
    ) -> Result<()> {
        let validator = jsonschema::validator_for(args_schema).map_err(|e| {
            Error::validation(format!("invalid args_schema for '{}': {}", name, e))
        })?;
        self.insert(owner, name, handler, Some(Arc::new(validator))).await
    }

    async fn insert(
        &self,
        owner: &OwnerRef,
        name: &str,
        handler: Arc<dyn CommandHandler>,
        schema: Option<Arc<jsonschema::Validator>>,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        // Checked under the write lock so a concurrent unregister_module
        // either sees this row or the revocation.
        owner.ensure_active()?;

        if let Some(existing) = entries.get(name) {
            return Err(Error::duplicate_name(format!(
                "command '{}' is already registered by '{}'",
                name,
                existing.owner.name()
            )));
        }
        entries.insert(
            name.to_string(),
            CommandEntry {
                owner: owner.clone(),
                handler,
                gate: CallGate::new(),
                schema,
            },
        );

        let count = entries.len();
        drop(entries);
        self.stats.write().await.registered = count;

        tracing::debug!(command = name, module = %owner.name(), "command_registered");
        Ok(())
    }

    /// Remove one command owned by `owner_id`, waiting for in-flight calls.
    pub async fn unregister(&self, owner_id: &ModuleId, name: &str) -> Result<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            match entries.get(name) {
                Some(e) if e.owner.id() == owner_id => {}
                _ => {
                    return Err(Error::not_found(format!(
                        "command '{}' is not registered by {}",
                        name, owner_id
                    )))
                }
            }
            let entry = entries.remove(name);
            self.stats.write().await.registered = entries.len();
            entry
        };

        if let Some(entry) = entry {
            if !entry.gate.close_and_drain(self.timeouts.unregister_grace).await {
                tracing::warn!(command = name, "unregister_grace_elapsed");
            }
        }
        tracing::debug!(command = name, "command_unregistered");
        Ok(())
    }

    /// Remove every command owned by `owner_id` in one batch and close their
    /// gates without waiting. Returns the removed gates.
    fn take_module(
        entries: &mut HashMap<String, CommandEntry>,
        owner_id: &ModuleId,
    ) -> Vec<(String, CallGate)> {
        let names: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.owner.id() == owner_id)
            .map(|(n, _)| n.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|n| entries.remove(&n).map(|e| (n, e.gate)))
            .inspect(|(_, gate)| gate.close())
            .collect()
    }

    /// Batch-remove a module's commands without waiting for in-flight calls.
    pub async fn revoke_module(&self, owner_id: &ModuleId) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let removed = Self::take_module(&mut entries, owner_id);
        self.stats.write().await.registered = entries.len();
        removed.into_iter().map(|(n, _)| n).collect()
    }

    /// Batch-remove a module's commands and wait (bounded) for in-flight calls.
    pub async fn unregister_module(&self, owner_id: &ModuleId) -> Vec<String> {
        let removed = {
            let mut entries = self.entries.write().await;
            let removed = Self::take_module(&mut entries, owner_id);
            self.stats.write().await.registered = entries.len();
            removed
        };

        let (names, gates): (Vec<String>, Vec<CallGate>) = removed.into_iter().unzip();
        let lingering = drain_all(gates, self.timeouts.unregister_grace).await;
        if lingering > 0 {
            tracing::warn!(module_id = %owner_id, lingering, "unregister_grace_elapsed");
        }
        tracing::debug!(module_id = %owner_id, count = names.len(), "module_commands_unregistered");
        names
    }

    // =========================================================================
    // Reload parking
    // =========================================================================

    /// Mark the module's current command names as reloading.
    pub async fn park_module(&self, owner_id: &ModuleId) -> ParkTicket {
        let names = self.commands_for(owner_id).await;
        let seq = self.park_seq.fetch_add(1, Ordering::Relaxed);
        let (done, rx) = watch::channel(false);
        let mut parked = self.parked.write().await;
        for name in &names {
            parked.insert(name.clone(), (seq, rx.clone()));
        }
        ParkTicket { seq, names, done }
    }

    /// Release a reload marker, waking every blocked caller.
    pub async fn unpark(&self, ticket: ParkTicket) {
        let mut parked = self.parked.write().await;
        for name in &ticket.names {
            if parked.get(name).map_or(false, |(seq, _)| *seq == ticket.seq) {
                parked.remove(name);
            }
        }
        drop(parked);
        let _ = ticket.done.send(true);
    }

    async fn wait_if_parked(&self, name: &str) -> Result<bool> {
        let rx = self.parked.read().await.get(name).map(|(_, rx)| rx.clone());
        let Some(mut rx) = rx else {
            return Ok(false);
        };
        let wait = self.timeouts.reload_wait;
        // A dropped sender also means the reload is over
        let finished = tokio::time::timeout(wait, rx.wait_for(|done| *done))
            .await
            .is_ok();
        if !finished {
            return Err(Error::timeout(format!(
                "command '{}' is reloading; waited {:?}",
                name, wait
            )));
        }
        Ok(true)
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Invoke a command outside any task.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        self.invoke_for(name, args, None).await
    }

    /// Invoke a command on behalf of `task_id`.
    ///
    /// A caller whose entry is withdrawn before its handler starts resolves
    /// the name once more, so a reload in progress makes it wait for the new
    /// registration rather than fail with NotFound.
    pub async fn invoke_for(&self, name: &str, args: Value, task_id: Option<&TaskId>) -> Result<Value> {
        let Some(entry) = self.resolve(name).await? else {
            return Err(self.missing(name, "is not registered").await);
        };
        if let CallOutcome::Completed(result) = self.dispatch(&entry, name, args.clone(), task_id).await {
            return result;
        }

        if let Some(entry) = self.resolve(name).await? {
            if let CallOutcome::Completed(result) = self.dispatch(&entry, name, args, task_id).await {
                return result;
            }
        }
        Err(self.missing(name, "was unregistered").await)
    }

    /// Live entry for `name`, waiting out a reload that parked it.
    async fn resolve(&self, name: &str) -> Result<Option<CommandEntry>> {
        if let Some(entry) = self.lookup(name).await {
            return Ok(Some(entry));
        }
        if self.wait_if_parked(name).await? {
            return Ok(self.lookup(name).await);
        }
        Ok(None)
    }

    async fn lookup(&self, name: &str) -> Option<CommandEntry> {
        self.entries
            .read()
            .await
            .get(name)
            .filter(|entry| entry.is_live())
            .cloned()
    }

    async fn missing(&self, name: &str, why: &str) -> Error {
        self.stats.write().await.not_found += 1;
        Error::not_found(format!("command '{}' {}", name, why))
    }

    async fn dispatch(
        &self,
        entry: &CommandEntry,
        name: &str,
        args: Value,
        task_id: Option<&TaskId>,
    ) -> CallOutcome<Value> {
        if let Some(schema) = &entry.schema {
            let problems: Vec<String> = schema.iter_errors(&args).map(|e| e.to_string()).collect();
            if !problems.is_empty() {
                self.stats.write().await.rejected_args += 1;
                let err = Error::validation(format!(
                    "arguments for '{}' rejected: {}",
                    name,
                    problems.join("; ")
                ));
                self.record(&entry.owner, name, task_id, Some(&err), 0);
                return CallOutcome::Completed(Err(err));
            }
        }

        let started = Instant::now();
        let handler = entry.handler.clone();
        let outcome = entry
            .owner
            .call(name, self.budget(), &entry.gate, async move { handler.call(name, args).await })
            .await;
        let CallOutcome::Completed(result) = outcome else {
            return CallOutcome::Withdrawn;
        };
        // NotFound raised inside a handler (a nested lookup, a missing
        // collaborator) is that handler's failure, not a miss on `name`.
        let result = result.map_err(|e| match e {
            Error::NotFound(message) => Error::handler(message),
            other => other,
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut stats = self.stats.write().await;
            stats.invocations += 1;
            if result.is_err() {
                stats.failures += 1;
            }
        }
        self.record(&entry.owner, name, task_id, result.as_ref().err(), elapsed_ms);
        CallOutcome::Completed(result)
    }

    fn record(
        &self,
        owner: &OwnerRef,
        name: &str,
        task_id: Option<&TaskId>,
        err: Option<&Error>,
        duration_ms: u64,
    ) {
        self.audit.record(
            AuditScope::module(owner.id(), owner.name()).with_task(task_id),
            AuditKind::CommandInvoked {
                command: name.to_string(),
                ok: err.is_none(),
                error_code: err.map(|e| e.code().to_string()),
                error: err.map(|e| e.to_string()),
                duration_ms,
            },
        );
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Owner of `name`, if registered.
    pub async fn owner_of(&self, name: &str) -> Option<ModuleId> {
        self.entries.read().await.get(name).map(|e| e.owner.id().clone())
    }

    /// Sorted command names owned by `owner_id`.
    pub async fn commands_for(&self, owner_id: &ModuleId) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.owner.id() == owner_id)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn list(&self) -> Vec<CommandInfo> {
        let mut infos: Vec<CommandInfo> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(name, e)| CommandInfo {
                name: name.clone(),
                module: e.owner.name().to_string(),
                module_id: e.owner.id().clone(),
                has_schema: e.schema.is_some(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn stats(&self) -> CommandStats {
        self.stats.read().await.clone()
    }
}
