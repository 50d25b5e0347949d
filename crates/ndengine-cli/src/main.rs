//! ndengine CLI
//!
//! Drives the dependency engine from the command line: a small array demo,
//! a randomised stress run and configuration inspection.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::error;

mod commands;
mod config;

use commands::{ConfigAction, DemoCommand, StressCommand};
use config::{CliConfig, ConfigBuilder};

#[derive(Parser)]
#[command(name = "ndengine")]
#[command(about = "Dependency-aware asynchronous execution engine")]
#[command(long_about = r#"
Runs operations that declare the variables they read and write, ordering
conflicting accesses in submission order and running the rest in parallel.

Examples:
  # Add one to [1, 2, 3, 4, 5], synchronously then asynchronously
  ndengine demo

  # 10k random operations over 8 variables with up to 200us completion delay
  ndengine stress --ops 10000 --vars 8 --max-delay-us 200

  # Effective configuration after file, environment and flags
  ndengine --threads 4 config show
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<String>,

    /// Worker threads per CPU lane
    #[arg(long, value_name = "N", global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the add-one array demo
    Demo(DemoCommand),

    /// Push random operations and verify the engine's ordering
    Stress(StressCommand),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("Command failed: {}", e);
        for cause in e.chain().skip(1) {
            error!("  Caused by: {}", cause);
        }
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ConfigBuilder::new()
        .path(cli.config)
        .threads(cli.threads)
        .log_level(cli.log_level)
        .log_format(cli.log_format)
        .build()
        .context("Failed to build configuration")?;
    setup_logging(&config)?;

    match cli.command {
        Some(Commands::Demo(cmd)) => cmd.execute(&config),
        Some(Commands::Stress(cmd)) => cmd.execute(&config),
        Some(Commands::Config { action }) => action.execute(&config),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn setup_logging(config: &CliConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .with_context(|| format!("Invalid log level '{}'", config.logging.level))?;

    // Logs go to stderr so command output stays machine readable.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match config.logging.format.as_str() {
        "json" => subscriber.json().init(),
        "compact" => subscriber.compact().init(),
        _ => subscriber.pretty().init(),
    }
    Ok(())
}
