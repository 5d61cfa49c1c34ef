//! Handler ownership and the shared call path.
//!
//! Registries never hold a module directly. Each command entry and event
//! subscription holds an `OwnerRef` (the owning module's id plus its health
//! counters and single-flight lane) and a `CallGate` that unregistration
//! closes and drains. Revoking an owner id makes every registry refuse new
//! rows for it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};

use crate::kernel::health::ModuleHealth;
use crate::kernel::recovery::with_recovery_async;
use crate::types::{Error, ModuleId, Result};

// =============================================================================
// Call gate
// =============================================================================

/// In-flight tracker for one command entry or subscription.
///
/// Callers hold a read guard for the duration of a handler call. Closing the
/// gate refuses new entries; draining waits for the outstanding guards.
#[derive(Debug, Clone, Default)]
pub struct CallGate {
    lock: Arc<RwLock<()>>,
    closed: Arc<AtomicBool>,
}

/// Proof that a call is in flight through a gate.
pub type CallPermit = OwnedRwLockReadGuard<()>;

impl CallGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate, or `None` if it is closed or draining.
    pub fn try_enter(&self) -> Option<CallPermit> {
        let permit = self.lock.clone().try_read_owned().ok()?;
        // A close that raced with entry is observed here; the drain will
        // either wait for this permit or we back out.
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(permit)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close and wait up to `grace` for in-flight calls. Returns false if
    /// calls were still running when the grace period ran out.
    pub async fn close_and_drain(&self, grace: Duration) -> bool {
        self.close();
        tokio::time::timeout(grace, self.lock.clone().write_owned())
            .await
            .is_ok()
    }
}

/// Wait for every gate; returns how many did not drain in time.
pub async fn drain_all(gates: Vec<CallGate>, grace: Duration) -> usize {
    let results =
        futures::future::join_all(gates.iter().map(|g| g.close_and_drain(grace))).await;
    results.into_iter().filter(|drained| !drained).count()
}

// =============================================================================
// Single-flight lane
// =============================================================================

/// Per-module queue serializing handler executions.
#[derive(Debug, Clone, Default)]
pub struct Lane {
    slot: Arc<Mutex<()>>,
}

impl Lane {
    /// Wait for the lane. tokio's mutex is FIFO, so waiters are served in
    /// arrival order.
    pub async fn acquire(&self, wait: Duration, owner: &str) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(wait, self.slot.clone().lock_owned())
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "waited {:?} for single-flight module '{}'",
                    wait, owner
                ))
            })
    }
}

// =============================================================================
// Owner
// =============================================================================

#[derive(Debug)]
struct OwnerInner {
    id: ModuleId,
    name: String,
    lane: Option<Lane>,
    health: Arc<ModuleHealth>,
    revoked: AtomicBool,
}

/// Opaque reference to the module instance that owns a registry row.
#[derive(Debug, Clone)]
pub struct OwnerRef {
    inner: Arc<OwnerInner>,
}

/// Timeout budgets applied on the call path.
#[derive(Debug, Clone, Copy)]
pub struct CallBudget {
    pub handler: Duration,
    pub single_flight_wait: Duration,
}

impl OwnerRef {
    pub fn new(id: ModuleId, name: impl Into<String>, single_flight: bool, health: Arc<ModuleHealth>) -> Self {
        Self {
            inner: Arc::new(OwnerInner {
                id,
                name: name.into(),
                lane: single_flight.then(Lane::default),
                health,
                revoked: AtomicBool::new(false),
            }),
        }
    }

    /// Owner for handlers registered by the host itself.
    pub fn host() -> Self {
        Self::new(ModuleId::host(), "host", false, Arc::new(ModuleHealth::new()))
    }

    pub fn id(&self) -> &ModuleId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_host(&self) -> bool {
        self.inner.id.is_host()
    }

    pub fn is_single_flight(&self) -> bool {
        self.inner.lane.is_some()
    }

    pub fn health(&self) -> &Arc<ModuleHealth> {
        &self.inner.health
    }

    /// Refuse all future registrations for this owner. Irreversible.
    pub fn revoke(&self) {
        self.inner.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(Error::quarantined(format!(
                "module '{}' ({}) is no longer accepting registrations",
                self.name(),
                self.id()
            )));
        }
        Ok(())
    }

    /// Run one handler call for this owner: queue on the lane if
    /// single-flight, enter the row's gate, bound by the handler timeout,
    /// catch panics, record the outcome against health.
    ///
    /// The gate is entered only once the lane is held, so a caller that
    /// queued across an unregister never starts. A lane wait timeout is
    /// returned without touching health.
    pub async fn call<Fut, T>(
        &self,
        label: &str,
        budget: CallBudget,
        gate: &CallGate,
        handler: Fut,
    ) -> CallOutcome<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _slot = match &self.inner.lane {
            Some(lane) => match lane.acquire(budget.single_flight_wait, self.name()).await {
                Ok(slot) => Some(slot),
                Err(e) => return CallOutcome::Completed(Err(e)),
            },
            None => None,
        };

        if self.is_revoked() {
            return CallOutcome::Withdrawn;
        }
        let Some(_permit) = gate.try_enter() else {
            return CallOutcome::Withdrawn;
        };

        let result = match tokio::time::timeout(budget.handler, with_recovery_async(handler, label)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "handler '{}' exceeded {:?}",
                label, budget.handler
            ))),
        };

        match &result {
            Ok(_) => self.inner.health.record_success(),
            Err(e) => {
                if let Some(consecutive) = self.inner.health.record_failure(e) {
                    tracing::warn!(
                        module = %self.name(),
                        module_id = %self.id(),
                        handler = label,
                        consecutive,
                        error = %e,
                        "handler_failed"
                    );
                }
            }
        }
        CallOutcome::Completed(result)
    }
}

/// Result of routing one call through an owner.
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The handler ran, or the lane wait timed out.
    Completed(Result<T>),
    /// The row was unregistered or its owner revoked before the handler started.
    Withdrawn,
}

impl<T> CallOutcome<T> {
    pub fn is_withdrawn(&self) -> bool {
        matches!(self, CallOutcome::Withdrawn)
    }

    /// Collapse into a result, using `withdrawn` for a call that never started.
    pub fn into_result(self, withdrawn: impl FnOnce() -> Error) -> Result<T> {
        match self {
            CallOutcome::Completed(result) => result,
            CallOutcome::Withdrawn => Err(withdrawn()),
        }
    }
}
