//! The add-one array walkthrough.

use anyhow::{Context, Result};
use clap::Args;
use ndengine::Engine;
use ndengine_ops::{ArrayOps, NdArray};
use tracing::info;

use crate::config::CliConfig;

#[derive(Args, Debug)]
pub struct DemoCommand {
    /// Initial array contents
    #[arg(long, value_delimiter = ',', default_values = ["1", "2", "3", "4", "5"])]
    pub values: Vec<f32>,
}

impl DemoCommand {
    pub fn execute(&self, config: &CliConfig) -> Result<()> {
        let engine = Engine::new(config.engine.clone()).context("Failed to start engine")?;
        let ops = ArrayOps::new(&engine);
        let array = NdArray::new(&engine, &self.values);
        info!(var = %array.var(), len = array.len(), "demo array created");

        println!("{:?}", ops.read(&array)?);
        ops.add_one(&array).context("add_one failed")?;
        ops.wait_all()?;
        println!("{:?}", ops.read(&array)?);
        ops.add_one_async(&array).context("add_one_async failed")?;
        ops.wait_all()?;
        println!("{:?}", ops.read(&array)?);

        ops.free(array)?;
        engine.shutdown();
        Ok(())
    }
}
