//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and environment variables.
//! A missing file is written out with defaults on first boot.

use crate::capability::HostPolicy;
use crate::types::Error;
use crate::validation::{validate_non_empty, validate_non_zero_duration, validate_positive};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct Config {
    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Timeout budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Crash/deadlock monitor thresholds.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Task dispatcher limits.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Host permission policy.
    #[serde(default)]
    pub policy: HostPolicy,

    /// Audit log retention and sink.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PathsConfig {
    /// Directories scanned for `<module>/module.json` manifests.
    pub module_dirs: Vec<PathBuf>,

    /// Root of per-module private stores.
    pub data_dir: PathBuf,

    /// Per-module configuration overlays (`<name>.json`).
    pub config_dir: PathBuf,

    /// Log directory.
    pub log_dir: PathBuf,

    /// Scratch directory.
    pub temp_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            module_dirs: vec![PathBuf::from("plugins")],
            data_dir: PathBuf::from("data"),
            config_dir: PathBuf::from("config"),
            log_dir: PathBuf::from("logs"),
            temp_dir: PathBuf::from("temp"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Timeout budgets, one per granularity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per command/event handler call.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub handler: Duration,

    /// Per submitted task.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub task: Duration,

    /// Per lifecycle transition (initialize, shutdown).
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub lifecycle: Duration,

    /// How long unregistration waits for in-flight calls to drain.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub unregister_grace: Duration,

    /// How long a caller queues for a single-flight module.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub single_flight_wait: Duration,

    /// How long a caller blocks on a command whose module is reloading.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub reload_wait: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handler: Duration::from_secs(30),
            task: Duration::from_secs(300),
            lifecycle: Duration::from_secs(10),
            unregister_grace: Duration::from_secs(5),
            single_flight_wait: Duration::from_secs(15),
            reload_wait: Duration::from_secs(10),
        }
    }
}

/// Crash/deadlock monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling period.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub interval: Duration,

    /// A worker without progress for this long is considered deadlocked.
    /// Must be shorter than `timeouts.handler`, or a hung handler times out
    /// as an ordinary step failure before the monitor sees it.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub stall_threshold: Duration,

    /// Consecutive failures that force a module into quarantine.
    pub failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(20),
            failure_threshold: 5,
        }
    }
}

/// Task dispatcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Optional ceiling on concurrent workers. `None` leaves the pool
    /// bounded only by the host scheduler.
    pub max_workers: Option<usize>,
}

/// Audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AuditConfig {
    /// In-memory retention; oldest entries are evicted beyond this.
    pub max_entries: Option<usize>,

    /// Optional JSON-lines file receiving every entry.
    pub file: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(10_000),
            file: None,
        }
    }
}

impl Config {
    /// Parse configuration from a JSON document.
    pub fn from_json_str(raw: &str) -> crate::types::Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, writing defaults there if it does not exist.
    ///
    /// Environment overrides are applied after the file is read.
    pub fn load_or_init(path: &Path) -> crate::types::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&raw)?
        } else {
            let config = Config::default();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(&config)?)?;
            tracing::info!(path = %path.display(), "default config written");
            config
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENTRY_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> crate::types::Result<()> {
        if let Some(dirs) = std::env::var_os("AGENTRY_MODULE_DIRS") {
            self.paths.module_dirs = std::env::split_paths(&dirs).collect();
        }
        if let Ok(dir) = std::env::var("AGENTRY_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("AGENTRY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(raw) = std::env::var("AGENTRY_MAX_WORKERS") {
            let max = raw.parse::<usize>().map_err(|e| {
                Error::validation(format!("AGENTRY_MAX_WORKERS must be an integer: {}", e))
            })?;
            self.dispatcher.max_workers = Some(max);
        }
        Ok(())
    }

    /// Reject configurations that would make bounded operations unbounded or instant.
    pub fn validate(&self) -> crate::types::Result<()> {
        let t = &self.timeouts;
        validate_non_zero_duration(t.handler, "timeouts.handler")?;
        validate_non_zero_duration(t.task, "timeouts.task")?;
        validate_non_zero_duration(t.lifecycle, "timeouts.lifecycle")?;
        validate_non_zero_duration(t.unregister_grace, "timeouts.unregister_grace")?;
        validate_non_zero_duration(t.single_flight_wait, "timeouts.single_flight_wait")?;
        validate_non_zero_duration(t.reload_wait, "timeouts.reload_wait")?;
        validate_non_zero_duration(self.monitor.interval, "monitor.interval")?;
        validate_non_zero_duration(self.monitor.stall_threshold, "monitor.stall_threshold")?;
        if self.monitor.stall_threshold >= t.handler {
            return Err(Error::validation(format!(
                "monitor.stall_threshold ({:?}) must be shorter than timeouts.handler ({:?})",
                self.monitor.stall_threshold, t.handler
            )));
        }
        validate_positive(self.monitor.failure_threshold, "monitor.failure_threshold")?;
        validate_non_empty(&self.observability.log_level, "observability.log_level")?;
        if let Some(max) = self.dispatcher.max_workers {
            validate_positive(max as u64, "dispatcher.max_workers")?;
        }
        Ok(())
    }

    /// Create the module, data, config, log and temp directories.
    pub fn ensure_directories(&self) -> crate::types::Result<()> {
        let p = &self.paths;
        for dir in p
            .module_dirs
            .iter()
            .chain([&p.data_dir, &p.config_dir, &p.log_dir, &p.temp_dir])
        {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Config)
    }
}
