//! Crash/deadlock monitor.
//!
//! Each cycle:
//! - abandons workers whose last progress is older than the stall threshold
//!   (their tasks fail with a Deadlock cause)
//! - quarantines Running modules whose consecutive-failure counter reached
//!   the failure threshold
//!
//! In-flight calls into a quarantined module are not killed; they finish or
//! hit their own timeout.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;

use crate::kernel::dispatcher::{Dispatcher, FailureCause};
use crate::kernel::lifecycle::LifecycleManager;
use crate::types::{MonitorConfig, TaskId};

/// Result of one monitor cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorReport {
    /// Tasks whose workers were abandoned as deadlocked.
    pub abandoned: Vec<TaskId>,
    /// Modules forced into quarantine.
    pub quarantined: Vec<String>,
    /// When the cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl MonitorReport {
    pub fn is_quiet(&self) -> bool {
        self.abandoned.is_empty() && self.quarantined.is_empty()
    }
}

/// Periodic sampler driving deadlock abandonment and threshold quarantine.
#[derive(Debug)]
pub struct Monitor {
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<LifecycleManager>,
    config: MonitorConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Monitor {
    pub fn new(dispatcher: Arc<Dispatcher>, lifecycle: Arc<LifecycleManager>, config: MonitorConfig) -> Self {
        Self {
            dispatcher,
            lifecycle,
            config,
            stop_tx: None,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Start the monitor loop in the background.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let lifecycle = self.lifecycle.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tracing::info!(
            interval = ?config.interval,
            stall_threshold = ?config.stall_threshold,
            failure_threshold = config.failure_threshold,
            "monitor_started"
        );

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = Self::cycle(&dispatcher, &lifecycle, &config).await;
                        if !report.is_quiet() {
                            tracing::info!(
                                abandoned = report.abandoned.len(),
                                quarantined = ?report.quarantined,
                                "monitor_cycle_acted"
                            );
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("monitor_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the monitor loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cycle now.
    pub async fn run_cycle(&self) -> MonitorReport {
        Self::cycle(&self.dispatcher, &self.lifecycle, &self.config).await
    }

    async fn cycle(
        dispatcher: &Dispatcher,
        lifecycle: &LifecycleManager,
        config: &MonitorConfig,
    ) -> MonitorReport {
        let mut report = MonitorReport::default();

        // Phase 1: stalled workers
        for task_id in dispatcher.stalled(config.stall_threshold).await {
            if dispatcher.abandon(&task_id, FailureCause::Deadlock).await {
                report.abandoned.push(task_id);
            }
        }

        // Phase 2: failing modules
        for sample in lifecycle.health_samples().await {
            if sample.consecutive_failures < config.failure_threshold {
                continue;
            }
            let reason = format!(
                "{} consecutive failures (threshold {})",
                sample.consecutive_failures, config.failure_threshold
            );
            if lifecycle.quarantine(&sample.module, &reason).await {
                report.quarantined.push(sample.module);
            } else {
                // Busy with an administrative operation; retried next cycle.
                tracing::debug!(module = %sample.module, "quarantine_deferred");
            }
        }

        tracing::debug!(
            abandoned = report.abandoned.len(),
            quarantined = report.quarantined.len(),
            "monitor_cycle_completed"
        );

        report.completed_at = Some(Utc::now());
        report
    }
}
