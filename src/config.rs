//! Engine Settings
//!
//! Settings are read from a YAML file and then overridden by
//! `FLOWRUNNER_*` environment variables. Every field has a default, so
//! a partial file (or none at all) is fine.
//!
//! ```yaml
//! results:
//!   storage_path: /var/lib/flowrunner/results
//! tasks:
//!   default_retries: 2
//!   default_retry_delay_ms: 500
//! locks:
//!   acquire_timeout_secs: 10
//! ```
//!
//! # Home Directory Resolution
//!
//! [`FLOWRUNNER_HOME`] is resolved once:
//! 1. The `FLOWRUNNER_HOME` environment variable
//! 2. `$HOME/.flowrunner`
//! 3. `.flowrunner` in the working directory

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base directory for results and lock files.
pub static FLOWRUNNER_HOME: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(home) = std::env::var("FLOWRUNNER_HOME") {
        debug!("Using FLOWRUNNER_HOME from environment: {}", home);
        return PathBuf::from(home);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".flowrunner");
    }
    PathBuf::from(".flowrunner")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid value {value} for {field}: {reason}")]
    Invalid {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },
}

/// Converts seconds from settings to a duration. Negative and NaN values
/// become zero; values too large to represent saturate.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn check_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    let reason = if !value.is_finite() {
        "must be finite"
    } else if value < 0.0 {
        "must not be negative"
    } else if Duration::try_from_secs_f64(value).is_err() {
        "is too large"
    } else {
        return Ok(());
    };
    Err(ConfigError::Invalid {
        field,
        value,
        reason,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsSettings {
    /// Where result values are stored
    pub storage_path: PathBuf,
    /// Where cache records are stored; defaults to `storage_path`
    pub key_storage_path: Option<PathBuf>,
}

impl Default for ResultsSettings {
    fn default() -> Self {
        Self {
            storage_path: FLOWRUNNER_HOME.join("storage"),
            key_storage_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub default_retries: u32,
    pub default_retry_delay_ms: u64,
    pub default_timeout_secs: Option<f64>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            default_retries: 0,
            default_retry_delay_ms: 0,
            default_timeout_secs: None,
        }
    }
}

impl TaskSettings {
    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs
            .filter(|s| *s > 0.0)
            .map(secs_to_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub max_retries: u32,
    pub jitter_factor: f64,
    pub backoff_base_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            jitter_factor: 0.2,
            backoff_base_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub acquire_timeout_secs: f64,
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 30.0,
            poll_interval_ms: 50,
        }
    }
}

impl LockSettings {
    pub fn acquire_timeout(&self) -> Duration {
        secs_to_duration(self.acquire_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Worker threads for the thread-pool runner; defaults to the CPU count
    pub max_workers: Option<usize>,
}

impl RunnerSettings {
    pub fn workers(&self) -> usize {
        self.max_workers.filter(|n| *n > 0).unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How long a cancelled body may keep running before the run is
    /// recorded as cancelled anyway
    pub cancellation_grace_ms: u64,
    pub pause_poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cancellation_grace_ms: 5_000,
            pause_poll_interval_ms: 200,
        }
    }
}

impl EngineSettings {
    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms.max(1))
    }
}

/// All engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub results: ResultsSettings,
    pub tasks: TaskSettings,
    pub client: ClientSettings,
    pub locks: LockSettings,
    pub runner: RunnerSettings,
    pub engine: EngineSettings,
}

impl Settings {
    /// Loads settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Loads settings from `path` if given, then applies environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Rejects durations and factors that cannot be used as configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("locks.acquire_timeout_secs", self.locks.acquire_timeout_secs)?;
        if let Some(secs) = self.tasks.default_timeout_secs {
            check_secs("tasks.default_timeout_secs", secs)?;
        }
        let jitter = self.client.jitter_factor;
        if !jitter.is_finite() || jitter < 0.0 {
            return Err(ConfigError::Invalid {
                field: "client.jitter_factor",
                value: jitter,
                reason: "must be a finite, non-negative factor",
            });
        }
        Ok(())
    }

    /// Applies `FLOWRUNNER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get("FLOWRUNNER_RESULTS_STORAGE_PATH") {
            self.results.storage_path = PathBuf::from(v);
        }
        if let Some(v) = get("FLOWRUNNER_RESULTS_KEY_STORAGE_PATH") {
            self.results.key_storage_path = Some(PathBuf::from(v));
        }
        set_parsed(&get, "FLOWRUNNER_TASKS_DEFAULT_RETRIES", &mut self.tasks.default_retries)?;
        set_parsed(
            &get,
            "FLOWRUNNER_TASKS_DEFAULT_RETRY_DELAY_MS",
            &mut self.tasks.default_retry_delay_ms,
        )?;
        if let Some(v) = get("FLOWRUNNER_TASKS_DEFAULT_TIMEOUT_SECS") {
            self.tasks.default_timeout_secs = Some(parse_var("FLOWRUNNER_TASKS_DEFAULT_TIMEOUT_SECS", &v)?);
        }
        set_parsed(&get, "FLOWRUNNER_CLIENT_MAX_RETRIES", &mut self.client.max_retries)?;
        set_parsed(&get, "FLOWRUNNER_CLIENT_JITTER_FACTOR", &mut self.client.jitter_factor)?;
        set_parsed(&get, "FLOWRUNNER_CLIENT_BACKOFF_BASE_MS", &mut self.client.backoff_base_ms)?;
        set_parsed(
            &get,
            "FLOWRUNNER_LOCKS_ACQUIRE_TIMEOUT_SECS",
            &mut self.locks.acquire_timeout_secs,
        )?;
        set_parsed(&get, "FLOWRUNNER_LOCKS_POLL_INTERVAL_MS", &mut self.locks.poll_interval_ms)?;
        if let Some(v) = get("FLOWRUNNER_RUNNER_MAX_WORKERS") {
            self.runner.max_workers = Some(parse_var("FLOWRUNNER_RUNNER_MAX_WORKERS", &v)?);
        }
        set_parsed(
            &get,
            "FLOWRUNNER_ENGINE_CANCELLATION_GRACE_MS",
            &mut self.engine.cancellation_grace_ms,
        )?;
        set_parsed(
            &get,
            "FLOWRUNNER_ENGINE_PAUSE_POLL_INTERVAL_MS",
            &mut self.engine.pause_poll_interval_ms,
        )?;
        self.validate()
    }

    /// Settings for the orchestration client's retry wrapper.
    pub fn client_retry(&self) -> crate::orchestration::ClientRetrySettings {
        crate::orchestration::ClientRetrySettings {
            max_retries: self.client.max_retries,
            jitter_factor: self.client.jitter_factor,
            base_backoff: Duration::from_millis(self.client.backoff_base_ms),
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn set_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = get(var) {
        *target = parse_var(var, &value)?;
    }
    Ok(())
}
