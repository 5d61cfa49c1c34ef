//! Per-module configuration overlay.
//!
//! Manifest `config` defaults, shallow-merged with `<config_dir>/<name>.json`.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::module::descriptor::ModuleDescriptor;
use crate::types::{Error, Result};

/// Resolved configuration for one module instance. Read-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleConfig {
    values: Map<String, Value>,
}

impl ModuleConfig {
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Load the overlay for `descriptor`. A missing overlay file yields the
    /// manifest defaults; an overlay that is not a JSON object is rejected.
    pub async fn load(config_dir: &Path, descriptor: &ModuleDescriptor) -> Result<Self> {
        let mut values = descriptor.config.clone();
        let path = config_dir.join(format!("{}.json", descriptor.name));

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let overlay: Value = serde_json::from_str(&raw)?;
                let Value::Object(overlay) = overlay else {
                    return Err(Error::validation(format!(
                        "config overlay {} must be a JSON object",
                        path.display()
                    )));
                };
                tracing::debug!(
                    module = %descriptor.name,
                    path = %path.display(),
                    keys = overlay.len(),
                    "config_overlay_applied"
                );
                values.extend(overlay);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed lookup. `Ok(None)` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).map_err(Error::from))
            .transpose()
    }

    pub fn all(&self) -> &Map<String, Value> {
        &self.values
    }
}
