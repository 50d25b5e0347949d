//! Randomised stress run that checks reader/writer exclusion and version counts.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use clap::Args;
use ndengine::{Context as DeviceContext, Engine, OpDescriptor, Scheduler, Var};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::CliConfig;

#[derive(Args, Debug)]
pub struct StressCommand {
    /// Operations to push
    #[arg(long, default_value = "10000", value_name = "N")]
    pub ops: usize,

    /// Variables shared by the operations
    #[arg(long, default_value = "8", value_name = "N")]
    pub vars: usize,

    /// Maximum read-only variables per operation
    #[arg(long, default_value = "2", value_name = "M")]
    pub readers: usize,

    /// Upper bound on an asynchronous operation's completion delay
    #[arg(long, default_value = "100", value_name = "MICROS")]
    pub max_delay_us: u64,

    /// CPU devices to spread operations over
    #[arg(long, default_value = "2", value_name = "N")]
    pub devices: i32,

    /// RNG seed; random when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct StressReport {
    pub seed: u64,
    pub ops: usize,
    pub elapsed_ms: u128,
    pub ops_per_sec: f64,
    pub completed: u64,
    pub failed: u64,
    pub violations: u64,
}

/// Occupancy of one variable: -1 while written, otherwise the reader count.
#[derive(Default)]
struct Occupancy {
    state: AtomicI64,
}

impl Occupancy {
    fn enter_write(&self) -> bool {
        self.state.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn leave_write(&self) {
        self.state.store(0, Ordering::SeqCst);
    }

    fn enter_read(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n >= 0).then_some(n + 1))
            .is_ok()
    }

    fn leave_read(&self) {
        self.state.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared state touched by every operation body.
struct Tracker {
    occupancy: Vec<Occupancy>,
    violations: AtomicU64,
}

impl Tracker {
    fn enter(&self, reads: &[usize], write: usize) {
        for &r in reads {
            if !self.occupancy[r].enter_read() {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
        if !self.occupancy[write].enter_write() {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, reads: &[usize], write: usize) {
        self.occupancy[write].leave_write();
        for &r in reads {
            self.occupancy[r].leave_read();
        }
    }
}

impl StressCommand {
    pub fn execute(&self, config: &CliConfig) -> Result<()> {
        ensure!(self.vars > 0, "--vars must be at least 1");
        ensure!(self.devices > 0, "--devices must be at least 1");
        let seed = self.seed.unwrap_or_else(rand::random);
        let report = self.run(config, seed)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("seed:        {}", report.seed);
            println!(
                "operations:  {} in {} ms ({:.0} ops/s)",
                report.ops, report.elapsed_ms, report.ops_per_sec
            );
            println!("completed:   {}", report.completed);
            println!("violations:  {}", report.violations);
        }
        ensure!(report.violations == 0, "{} exclusion violations (seed {seed})", report.violations);
        Ok(())
    }

    fn run(&self, config: &CliConfig, seed: u64) -> Result<StressReport> {
        info!(seed, ops = self.ops, vars = self.vars, "starting stress run");
        let engine = Engine::new(config.engine.clone()).context("Failed to start engine")?;
        let vars: Vec<Var> = (0..self.vars).map(|_| engine.new_variable()).collect();
        let tracker = Arc::new(Tracker {
            occupancy: (0..self.vars).map(|_| Occupancy::default()).collect(),
            violations: AtomicU64::new(0),
        });
        let mut writes = vec![0u64; self.vars];
        let mut rng = StdRng::seed_from_u64(seed);
        let indices: Vec<usize> = (0..self.vars).collect();

        let start = Instant::now();
        for _ in 0..self.ops {
            let write = rng.gen_range(0..self.vars);
            let n_reads = rng.gen_range(0..=self.readers.min(self.vars - 1));
            let reads: Vec<usize> = indices
                .choose_multiple(&mut rng, n_reads + 1)
                .copied()
                .filter(|&i| i != write)
                .take(n_reads)
                .collect();
            writes[write] += 1;

            let ctx = DeviceContext::cpu(rng.gen_range(0..self.devices));
            let op = if rng.gen_bool(0.5) {
                let delay = Duration::from_micros(rng.gen_range(0..=self.max_delay_us));
                let (tracker, reads) = (Arc::clone(&tracker), reads.clone());
                OpDescriptor::new_async(ctx, move |_rctx, done| {
                    tracker.enter(&reads, write);
                    thread::spawn(move || {
                        thread::sleep(delay);
                        tracker.leave(&reads, write);
                        done.complete();
                    });
                })
            } else {
                let (tracker, reads) = (Arc::clone(&tracker), reads.clone());
                OpDescriptor::new_sync(ctx, move |_rctx| {
                    tracker.enter(&reads, write);
                    tracker.leave(&reads, write);
                    Ok(())
                })
            };
            engine
                .push_async(
                    op.reads(reads.iter().map(|&i| vars[i])).writes([vars[write]]).name("stress"),
                )
                .context("push failed")?;
        }
        engine.wait_all().context("wait_all failed")?;
        let elapsed = start.elapsed();

        for (i, &var) in vars.iter().enumerate() {
            ensure!(
                engine.var_version(var) == writes[i],
                "{var}: version {} but {} writes were pushed",
                engine.var_version(var),
                writes[i]
            );
            engine.delete_variable(var)?;
        }
        engine.wait_all()?;

        let stats = engine.stats();
        debug!(?stats, "stress run finished");
        Ok(StressReport {
            seed,
            ops: self.ops,
            elapsed_ms: elapsed.as_millis(),
            ops_per_sec: self.ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            completed: stats.completed,
            failed: stats.failed,
            violations: tracker.violations.load(Ordering::SeqCst),
        })
    }
}
