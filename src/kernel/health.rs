//! Per-module health counters.
//!
//! Counters are shared between the lifecycle manager (owner), the command
//! registry and event bus (which record outcomes) and the monitor (which
//! samples them). All fields are atomics so recording never blocks a handler
//! path.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::types::Error;

/// Coarse health classification relative to the quarantine threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No consecutive failures.
    Healthy,
    /// Failing, but below half the threshold.
    Degraded,
    /// At or above half the threshold.
    Failing,
}

/// Live counters for one module instance.
#[derive(Debug, Default)]
pub struct ModuleHealth {
    consecutive_failures: AtomicU32,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    /// Unix millis; 0 = never.
    last_success_ms: AtomicI64,
    last_failure_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl ModuleHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_success_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Record a failed call. Returns the new consecutive failure count, or
    /// `None` when the error is not chargeable to the module.
    pub fn record_failure(&self, err: &Error) -> Option<u32> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if !err.counts_against_health() {
            return None;
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
        Some(self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Clear the consecutive counter (fresh instance after reload).
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn snapshot(&self, failure_threshold: u32) -> HealthSnapshot {
        let consecutive = self.consecutive_failures();
        let status = if consecutive == 0 {
            HealthStatus::Healthy
        } else if consecutive.saturating_mul(2) < failure_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Failing
        };
        HealthSnapshot {
            status,
            consecutive_failures: consecutive,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_success: from_millis(self.last_success_ms.load(Ordering::Relaxed)),
            last_failure: from_millis(self.last_failure_ms.load(Ordering::Relaxed)),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Point-in-time view of a module's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
