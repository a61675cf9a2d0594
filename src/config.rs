//! Engine Configuration
//!
//! Settings are read from an optional YAML file, then overridden from the
//! environment, then validated. Every field has a default so an empty file
//! (or no file at all) yields a working local configuration.
//!
//! # Example
//!
//! ```yaml
//! backend: remote
//! run_timeout_secs: 300
//! batch_size: 500
//! retry:
//!   max_attempts: 3
//! sandbox:
//!   provider: process
//!   memory_limit_mb: 1024
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{BackendKind, RetryPolicy};
use crate::remote::SandboxLimits;

pub const ENV_BACKEND: &str = "PIPERUNNER_BACKEND";
pub const ENV_RUN_TIMEOUT: &str = "PIPERUNNER_RUN_TIMEOUT_SECS";
pub const ENV_BATCH_SIZE: &str = "PIPERUNNER_BATCH_SIZE";
pub const ENV_WORKER: &str = "PIPERUNNER_WORKER";

/// Ten minutes.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Where the per-run table store lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    #[default]
    File,
    Memory,
}

/// Which sandbox implementation the remote backend allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    #[default]
    Process,
    Thread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub provider: SandboxKind,
    /// Parent directory for sandbox directories. Defaults to the system temp dir.
    pub root: Option<PathBuf>,
    pub cpu_limit: usize,
    pub memory_limit_mb: u64,
    pub disk_limit_mb: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_grace_ms: u64,
    pub create_timeout_secs: u64,
    pub max_sandboxes: usize,
    pub worker_program: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: SandboxKind::default(),
            root: None,
            cpu_limit: num_cpus::get(),
            memory_limit_mb: 2048,
            disk_limit_mb: 4096,
            heartbeat_interval_ms: 1000,
            heartbeat_grace_ms: 5000,
            create_timeout_secs: 30,
            max_sandboxes: 4,
            worker_program: None,
        }
    }
}

impl SandboxConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("piperunner-sandboxes"))
    }

    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            cpu_limit: self.cpu_limit,
            memory_limit_mb: self.memory_limit_mb,
            disk_limit_mb: self.disk_limit_mb,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Run directories are created under `<working_dir>/runs/`.
    pub working_dir: PathBuf,
    /// Zero disables the run timeout.
    pub run_timeout_secs: u64,
    pub batch_size: usize,
    pub store: StoreMode,
    /// Keep `store.db` after the run instead of deleting it at teardown.
    pub keep_store: bool,
    pub retry: RetryPolicy,
    pub sandbox: SandboxConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            working_dir: PathBuf::from("."),
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            store: StoreMode::default(),
            keep_store: false,
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a config file, applies environment overrides and validates.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| env::var(var).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BACKEND) {
            self.backend = match value.trim().to_ascii_lowercase().as_str() {
                "local" => BackendKind::Local,
                "remote" => BackendKind::Remote,
                _ => return Err(invalid_env(ENV_BACKEND, &value)),
            };
        }
        if let Some(value) = lookup(ENV_RUN_TIMEOUT) {
            self.run_timeout_secs = value
                .trim()
                .parse()
                .map_err(|_| invalid_env(ENV_RUN_TIMEOUT, &value))?;
        }
        if let Some(value) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = value
                .trim()
                .parse()
                .map_err(|_| invalid_env(ENV_BATCH_SIZE, &value))?;
        }
        if let Some(value) = lookup(ENV_WORKER) {
            if !value.trim().is_empty() {
                self.sandbox.worker_program = Some(PathBuf::from(value.trim()));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms".into(),
            ));
        }
        let sandbox = &self.sandbox;
        if sandbox.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        if sandbox.heartbeat_grace_ms <= sandbox.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "sandbox.heartbeat_grace_ms ({}) must be larger than heartbeat_interval_ms ({})",
                sandbox.heartbeat_grace_ms, sandbox.heartbeat_interval_ms
            )));
        }
        if sandbox.cpu_limit == 0 {
            return Err(ConfigError::Invalid("sandbox.cpu_limit must be at least 1".into()));
        }
        if sandbox.max_sandboxes == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_sandboxes must be at least 1".into(),
            ));
        }
        if sandbox.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.memory_limit_mb must be at least 1".into(),
            ));
        }
        if sandbox.disk_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.disk_limit_mb must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.working_dir.join("runs")
    }
}

fn invalid_env(var: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    }
}
