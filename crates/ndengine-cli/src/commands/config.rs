use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use ndengine::EngineConfig;
use serde::Serialize;

use crate::config::CliConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ConfigFormat {
    Toml,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective engine configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: ConfigFormat,
    },
}

/// Same `[engine]` layout as the config file.
#[derive(Serialize)]
struct EngineTable<'a> {
    engine: &'a EngineConfig,
}

impl ConfigAction {
    pub fn execute(&self, config: &CliConfig) -> Result<()> {
        let text = match self {
            Self::Show { format: ConfigFormat::Toml } => {
                config.engine.to_toml().context("Failed to serialize configuration")?
            }
            Self::Show { format: ConfigFormat::Json } => {
                serde_json::to_string_pretty(&EngineTable { engine: &config.engine })
                    .context("Failed to serialize configuration")?
            }
        };
        println!("{text}");
        Ok(())
    }
}
