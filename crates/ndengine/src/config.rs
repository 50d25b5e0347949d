//! Engine configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable prefix for engine overrides.
pub const ENV_PREFIX: &str = "NDENGINE_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnv { key: String, value: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What the engine does with the dependents of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record and log the failure; dependents run normally.
    #[default]
    LogAndContinue,
    /// Taint the failed operation's mutable variables and skip later users.
    SkipDependents,
    /// Stop dispatching work on the failing operation's lane.
    HaltLane,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "log_and_continue" | "log" | "continue" => Ok(Self::LogAndContinue),
            "skip_dependents" | "skip" => Ok(Self::SkipDependents),
            "halt_lane" | "halt" => Ok(Self::HaltLane),
            other => Err(format!("unknown failure policy `{other}`")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LogAndContinue => "log_and_continue",
            Self::SkipDependents => "skip_dependents",
            Self::HaltLane => "halt_lane",
        })
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers per CPU-kind compute lane.
    pub cpu_worker_threads: usize,
    /// Workers per GPU compute lane.
    pub gpu_worker_threads: usize,
    /// Workers per dedicated copy lane.
    pub copy_worker_threads: usize,
    /// Route device copies to their own lane per context.
    pub dedicated_copy_lanes: bool,
    /// Upper bound on outstanding operations per lane.
    pub max_pending_per_lane: usize,
    /// Synchronous operations sharing one stream synchronisation.
    pub bulk_size: usize,
    pub failure_policy: FailurePolicy,
    pub thread_name_prefix: String,
    /// Worker stack size in bytes; platform default when unset.
    pub stack_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_worker_threads: num_cpus::get().max(1),
            gpu_worker_threads: 1,
            copy_worker_threads: 1,
            dedicated_copy_lanes: true,
            max_pending_per_lane: 65536,
            bulk_size: 15,
            failure_policy: FailurePolicy::LogAndContinue,
            thread_name_prefix: "ndengine".to_string(),
            stack_size: None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: Option<EngineConfig>,
}

impl EngineConfig {
    /// Load from a TOML file holding an `[engine]` table.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_toml(&content)
    }

    /// Parse TOML text. Missing fields, or a missing `[engine]` table, take defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.engine.unwrap_or_default())
    }

    /// Apply `NDENGINE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from any `NDENGINE_*` key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("CPU_WORKER_THREADS") {
            self.cpu_worker_threads = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("GPU_WORKER_THREADS") {
            self.gpu_worker_threads = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("COPY_WORKER_THREADS") {
            self.copy_worker_threads = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("DEDICATED_COPY_LANES") {
            self.dedicated_copy_lanes = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_PENDING_PER_LANE") {
            self.max_pending_per_lane = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("BULK_SIZE") {
            self.bulk_size = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("FAILURE_POLICY") {
            self.failure_policy = parse_env(&key, &value)?;
        }
        if let Some((_, value)) = get("THREAD_NAME_PREFIX") {
            self.thread_name_prefix = value;
        }
        if let Some((key, value)) = get("STACK_SIZE") {
            self.stack_size = Some(parse_env(&key, &value)?);
        }
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_worker_threads == 0 {
            return Err(ConfigError::Invalid("cpu_worker_threads must be greater than 0".into()));
        }
        if self.gpu_worker_threads == 0 {
            return Err(ConfigError::Invalid("gpu_worker_threads must be greater than 0".into()));
        }
        if self.copy_worker_threads == 0 {
            return Err(ConfigError::Invalid("copy_worker_threads must be greater than 0".into()));
        }
        if self.max_pending_per_lane == 0 {
            return Err(ConfigError::Invalid("max_pending_per_lane must be greater than 0".into()));
        }
        if self.bulk_size == 0 {
            return Err(ConfigError::Invalid("bulk_size must be greater than 0".into()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid("thread_name_prefix must not be empty".into()));
        }
        if let Some(stack) = self.stack_size {
            if stack < 64 * 1024 {
                return Err(ConfigError::Invalid(format!(
                    "stack_size must be at least 65536 bytes, got {stack}"
                )));
            }
        }
        Ok(())
    }

    /// Render as a TOML document with an `[engine]` table.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        #[derive(Serialize)]
        struct Out<'a> {
            engine: &'a EngineConfig,
        }
        toml::to_string_pretty(&Out { engine: self })
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
