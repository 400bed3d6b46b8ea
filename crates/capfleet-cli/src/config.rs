//! Configuration file support for Capfleet.
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! # Capfleet configuration file
//!
//! nats_url: nats://localhost:4222
//! hub_url: http://localhost:8080
//!
//! worker:
//!   cache_dir: /var/lib/capfleet/models
//!   max_concurrent: 1
//!   max_loaded: 2
//!   hosted_runner: ["python3", "/opt/capfleet/runner.py"]
//!
//! coordinator:
//!   job_deadline_secs: 60
//!   control_timeout_secs: 30
//!
//! logging:
//!   level: info
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Broker URL.
    pub nats_url: Option<String>,

    /// Model hub base URL.
    pub hub_url: Option<String>,

    /// Worker configuration.
    pub worker: WorkerSection,

    /// Coordinator configuration.
    pub coordinator: CoordinatorSection,

    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Local model cache directory.
    pub cache_dir: PathBuf,

    /// Stable worker identity (generated per session when unset).
    pub worker_id: Option<String>,

    /// Maximum concurrent inferences.
    pub max_concurrent: usize,

    /// Memory ceiling: loaded models beyond this are LRU-evicted.
    pub max_loaded: usize,

    /// Runner command for hosted models; the model directory is appended.
    pub hosted_runner: Vec<String>,

    /// Runner command for custom models; the installed code file is appended.
    pub custom_runner: Vec<String>,

    /// Heartbeat interval in seconds.
    pub heartbeat_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./model-cache"),
            worker_id: None,
            max_concurrent: 1,
            max_loaded: 2,
            hosted_runner: Vec::new(),
            custom_runner: vec!["python3".to_string()],
            heartbeat_secs: 5,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// Job deadline in seconds; unresolved pairs time out after this.
    pub job_deadline_secs: u64,

    /// Timeout for control operations on a worker, in seconds.
    pub control_timeout_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            job_deadline_secs: 60,
            control_timeout_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load a configuration file, detecting the format by extension.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("invalid YAML in {}: {e}", path.display()))?,
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("invalid TOML in {}: {e}", path.display()))?,
            _ => anyhow::bail!(
                "unsupported config format: {} (expected .yaml, .yml, or .toml)",
                path.display()
            ),
        };
        Ok(config)
    }

    /// Load the config file if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
