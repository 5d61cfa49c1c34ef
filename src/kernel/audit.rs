//! Audit log: append-only record of lifecycle transitions, command
//! outcomes, event delivery failures, permission denials and task results.
//!
//! Entries carry a monotonically increasing sequence number and are kept in
//! memory (bounded by `AuditConfig::max_entries`) and optionally mirrored to
//! a JSON-lines file. The file is written by a background task; `record`
//! only queues the serialized line.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};

use crate::capability::{DenyReason, Permission};
use crate::kernel::types::ModuleState;
use crate::types::{AuditConfig, Error, ModuleId, Result, TaskId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    Transition {
        from: ModuleState,
        to: ModuleState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CommandInvoked {
        command: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },
    EventDeliveryFailed {
        event: String,
        error_code: String,
        error: String,
    },
    PermissionDenied {
        permission: Permission,
        reason: DenyReason,
    },
    Quarantined {
        reason: String,
    },
    BackgroundFailed {
        error: String,
    },
    DiscoveryRejected {
        location: String,
        error: String,
    },
    TaskFinished {
        label: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
        steps: usize,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<ModuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

/// Who an entry is about.
#[derive(Debug, Clone, Default)]
pub struct AuditScope {
    pub module_id: Option<ModuleId>,
    pub module: Option<String>,
    pub task_id: Option<TaskId>,
}

impl AuditScope {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn module(id: &ModuleId, name: &str) -> Self {
        Self {
            module_id: Some(id.clone()),
            module: Some(name.to_string()),
            task_id: None,
        }
    }

    pub fn task(task_id: &TaskId) -> Self {
        Self {
            task_id: Some(task_id.clone()),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task_id: Option<&TaskId>) -> Self {
        self.task_id = task_id.cloned();
        self
    }
}

enum SinkMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
struct AuditInner {
    entries: VecDeque<AuditEntry>,
    next_seq: u64,
    sink: Option<mpsc::UnboundedSender<SinkMessage>>,
}

/// Append-only, ordered audit log.
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<AuditInner>,
    max_entries: Option<usize>,
}

impl AuditLog {
    /// In-memory log without retention limit or file sink.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::new(),
                next_seq: 1,
                sink: None,
            }),
            max_entries: None,
        }
    }

    /// Build from configuration. A configured file sink spawns its writer
    /// on the current tokio runtime.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let sink = match &config.file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                    Error::internal("the audit file sink must be created inside a tokio runtime")
                })?;
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(run_sink(tokio::fs::File::from_std(file), rx));
                Some(tx)
            }
            None => None,
        };
        Ok(Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::new(),
                next_seq: 1,
                sink,
            }),
            max_entries: config.max_entries,
        })
    }

    fn lock(&self) -> MutexGuard<'_, AuditInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry; returns its sequence number.
    pub fn record(&self, scope: AuditScope, kind: AuditKind) -> u64 {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = AuditEntry {
            seq,
            timestamp: Utc::now(),
            module_id: scope.module_id,
            module: scope.module,
            task_id: scope.task_id,
            kind,
        };
        tracing::debug!(seq, module = ?entry.module, task_id = ?entry.task_id, kind = ?entry.kind, "audit");

        // Queued under the lock so the file keeps sequence order
        if let Some(sink) = &inner.sink {
            match serde_json::to_string(&entry) {
                Ok(mut line) => {
                    line.push('\n');
                    if sink.send(SinkMessage::Line(line)).is_err() {
                        tracing::warn!(seq, "audit_sink_closed");
                    }
                }
                Err(e) => tracing::warn!(seq, error = %e, "audit_sink_encode_failed"),
            }
        }

        inner.entries.push_back(entry);
        if let Some(max) = self.max_entries {
            while inner.entries.len() > max {
                inner.entries.pop_front();
            }
        }
        seq
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Entries with `seq > after`.
    pub fn since(&self, after: u64) -> Vec<AuditEntry> {
        self.query(|e| e.seq > after)
    }

    pub fn for_module(&self, name: &str) -> Vec<AuditEntry> {
        self.query(|e| e.module.as_deref() == Some(name))
    }

    pub fn for_task(&self, task_id: &TaskId) -> Vec<AuditEntry> {
        self.query(|e| e.task_id.as_ref() == Some(task_id))
    }

    pub fn query<F>(&self, filter: F) -> Vec<AuditEntry>
    where
        F: Fn(&AuditEntry) -> bool,
    {
        self.lock().entries.iter().filter(|e| filter(e)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Sequence number of the newest entry (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }

    /// Wait until every entry recorded so far has reached the file sink.
    pub async fn flush(&self) {
        let sink = self.lock().sink.clone();
        let Some(sink) = sink else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if sink.send(SinkMessage::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Write queued lines, flushing whenever the backlog drains.
async fn run_sink(file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
    let mut writer = BufWriter::new(file);
    while let Some(message) = rx.recv().await {
        let written = match message {
            SinkMessage::Line(line) => writer.write_all(line.as_bytes()).await,
            SinkMessage::Flush(ack) => {
                let flushed = writer.flush().await;
                let _ = ack.send(());
                flushed
            }
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "audit_sink_write_failed");
        }
        if rx.is_empty() {
            if let Err(e) = writer.flush().await {
                tracing::warn!(error = %e, "audit_sink_flush_failed");
            }
        }
    }
    let _ = writer.flush().await;
}
