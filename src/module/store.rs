//! Private per-module key-value store.
//!
//! Backed by `<data_dir>/modules/<name>/store.json`. Writes go through to disk
//! (temp file + rename). The store is owned by one module instance and is
//! closed when that instance unloads; a closed store rejects every call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::types::{Error, Result};

const STORE_FILE: &str = "store.json";

#[derive(Debug)]
struct StoreState {
    values: BTreeMap<String, Value>,
    dirty: bool,
    closed: bool,
}

/// JSON-file key-value store for a single module.
#[derive(Debug)]
pub struct ModuleStore {
    module: String,
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl ModuleStore {
    /// Open (or create) the store for `module` under `data_dir`.
    pub async fn open(data_dir: &Path, module: &str) -> Result<Self> {
        let dir = data_dir.join("modules").join(module);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(STORE_FILE);

        let values = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::validation(format!("corrupt store {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(module, path = %path.display(), keys = values.len(), "store_opened");
        Ok(Self {
            module: module.to_string(),
            path,
            state: Mutex::new(StoreState {
                values,
                dirty: false,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self, state: &StoreState) -> Result<()> {
        if state.closed {
            return Err(Error::quarantined(format!(
                "store for module '{}' is closed",
                self.module
            )));
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let state = self.state.lock().await;
        self.ensure_open(&state)?;
        Ok(state.values.get(key).cloned())
    }

    /// Typed read.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        state.values.insert(key.into(), value);
        state.dirty = true;
        self.write(&mut state).await
    }

    /// Remove a key, returning its previous value.
    pub async fn remove(&self, key: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        let previous = state.values.remove(key);
        if previous.is_some() {
            state.dirty = true;
            self.write(&mut state).await?;
        }
        Ok(previous)
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        self.ensure_open(&state)?;
        Ok(state.values.keys().cloned().collect())
    }

    /// Persist pending changes.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        self.write(&mut state).await
    }

    /// Flush and refuse further access. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let flushed = self.write(&mut state).await;
        state.closed = true;
        tracing::debug!(module = %self.module, "store_closed");
        flushed
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    async fn write(&self, state: &mut StoreState) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }
        let raw = serde_json::to_vec_pretty(&state.values)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        state.dirty = false;
        Ok(())
    }
}
