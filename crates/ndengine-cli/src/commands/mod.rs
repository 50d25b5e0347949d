//! CLI command implementations

pub mod config;
pub mod demo;
pub mod stress;

pub use config::ConfigAction;
pub use demo::DemoCommand;
pub use stress::StressCommand;
