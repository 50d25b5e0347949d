//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ndengine::{Engine, EngineConfig, FailurePolicy};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Route engine logs to the test harness; `RUST_LOG` overrides the level.
pub fn setup_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn config(cpu_workers: usize) -> EngineConfig {
    EngineConfig { cpu_worker_threads: cpu_workers, ..Default::default() }
}

pub fn engine(cpu_workers: usize) -> Engine {
    setup_test_tracing();
    Engine::new(config(cpu_workers)).expect("engine")
}

pub fn engine_with_policy(cpu_workers: usize, policy: FailurePolicy) -> Engine {
    setup_test_tracing();
    Engine::new(EngineConfig { failure_policy: policy, ..config(cpu_workers) }).expect("engine")
}

/// One-way latch: closed until `open` is called.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            let (guard, timeout) = self.cv.wait_timeout(open, Duration::from_secs(30)).unwrap();
            open = guard;
            assert!(!timeout.timed_out(), "gate never opened");
        }
    }
}

/// Shared counter for cleanup and execution tallies.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Cleanup action that bumps this counter.
    pub fn action(&self) -> impl FnOnce() + Send + 'static {
        let counter = self.clone();
        move || counter.bump()
    }
}

/// Ordered record of events, for asserting execution order.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
