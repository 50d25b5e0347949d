//! Effective CLI configuration: engine settings plus logging flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndengine::EngineConfig;

pub const DEFAULT_CONFIG_FILE: &str = "ndengine.toml";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Builds the effective configuration: file, then environment, then flags.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    path: Option<PathBuf>,
    threads: Option<usize>,
    log_level: Option<String>,
    log_format: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An explicit path must exist; without one `ndengine.toml` is used if present.
    pub fn path(mut self, path: Option<PathBuf>) -> Self {
        self.path = path;
        self
    }

    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn log_level(mut self, level: Option<String>) -> Self {
        self.log_level = level;
        self
    }

    pub fn log_format(mut self, format: Option<String>) -> Self {
        self.log_format = format;
        self
    }

    pub fn build(self) -> Result<CliConfig> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        let path = self.path.or_else(|| default_file.exists().then(|| default_file.to_path_buf()));
        let engine = match &path {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load config file {}", path.display()))?,
            None => EngineConfig::default(),
        };

        let mut engine =
            engine.with_env_overrides().context("Invalid NDENGINE_* environment override")?;
        if let Some(threads) = self.threads {
            engine.cpu_worker_threads = threads;
        }
        engine.validate().context("Invalid engine configuration")?;

        let mut logging = LoggingConfig::default();
        if let Some(level) = self.log_level {
            logging.level = level;
        }
        if let Some(format) = self.log_format {
            logging.format = format;
        }
        Ok(CliConfig { engine, logging })
    }
}
