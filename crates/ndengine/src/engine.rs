//! The engine instance and the [`Scheduler`] interface clients program against.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::completion::{CompletionSink, Signal};
use crate::config::EngineConfig;
use crate::context::{Context, FnProperty};
use crate::error::{EngineError, OpError, Result};
use crate::graph::{Dispatch, SchedState};
use crate::lane::{on_lane_worker, HostStreams, Lane, LaneClass, LaneKey, StreamProvider};
use crate::operation::{OpBody, OpDescriptor, OprId};
use crate::outcome::{OpStatus, OutcomeObserver};
use crate::sync::{lock, wait};
use crate::var::{Var, VarAccess};

/// Push and wait interface handed to clients.
///
/// Object safe: clients hold a `&dyn Scheduler` and never name the engine.
pub trait Scheduler: Send + Sync {
    /// Allocate a fresh variable.
    fn new_variable(&self) -> Var;

    /// Run a synchronous operation and block until it has completed.
    fn push_sync(&self, op: OpDescriptor) -> Result<()>;

    /// Submit an operation. Blocks only if the descriptor's `wait` flag is set.
    fn push_async(&self, op: OpDescriptor) -> Result<()>;

    /// Destroy `var` once every earlier access to it has finished.
    fn delete_variable(&self, var: Var) -> Result<()>;

    /// Block until every access to `var` pushed so far has finished.
    fn wait_for_var(&self, var: Var) -> Result<()>;

    /// Block until no operation is pending.
    fn wait_all(&self) -> Result<()>;
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pushed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: usize,
    pub live_variables: usize,
    pub lanes: Vec<LaneStats>,
    pub halted_lanes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: String,
    pub class: LaneClass,
    pub workers: usize,
    pub queued: usize,
    pub pending: usize,
}

#[derive(Default)]
struct LaneRegistry {
    lanes: HashMap<LaneKey, Lane>,
    closed: bool,
}

struct EngineInner {
    config: EngineConfig,
    state: Mutex<SchedState>,
    drained: Condvar,
    lanes: Mutex<LaneRegistry>,
    provider: Arc<dyn StreamProvider>,
    observers: Vec<Arc<dyn OutcomeObserver>>,
    next_var: AtomicU64,
    shut_down: AtomicBool,
    this: Weak<EngineInner>,
}

/// Dependency engine owning its lanes and worker threads.
///
/// Dropping the engine drains outstanding work and joins every worker.
/// An asynchronous operation whose completion token is held forever
/// therefore blocks the drop.
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    provider: Arc<dyn StreamProvider>,
    observers: Vec<Arc<dyn OutcomeObserver>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            provider: Arc::new(HostStreams),
            observers: Vec::new(),
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stream_provider(mut self, provider: Arc<dyn StreamProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn OutcomeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        info!(
            cpu_workers = self.config.cpu_worker_threads,
            gpu_workers = self.config.gpu_worker_threads,
            policy = %self.config.failure_policy,
            "starting engine"
        );
        let inner = Arc::new_cyclic(|this| EngineInner {
            state: Mutex::new(SchedState::new(self.config.failure_policy)),
            config: self.config,
            drained: Condvar::new(),
            lanes: Mutex::new(LaneRegistry::default()),
            provider: self.provider,
            observers: self.observers,
            next_var: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        });
        Ok(Engine { inner })
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current grants on `var`.
    pub fn var_access(&self, var: Var) -> VarAccess {
        lock(&self.inner.state).var_access(var)
    }

    /// Number of completed writes to `var`. Zero for unused variables.
    pub fn var_version(&self, var: Var) -> u64 {
        lock(&self.inner.state).var_version(var)
    }

    pub fn is_deleted(&self, var: Var) -> bool {
        lock(&self.inner.state).is_deleted(var)
    }

    /// Accept work on a halted lane again. Returns the failure that halted it.
    pub fn resume_lane(&self, lane: &LaneKey) -> Option<OpError> {
        let error = lock(&self.inner.state).resume_lane(lane);
        if error.is_some() {
            info!(%lane, "lane resumed");
        }
        error
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats()
    }

    /// Reject new pushes, drain pending work, and join all lane workers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Scheduler for Engine {
    fn new_variable(&self) -> Var {
        Var::from_id(self.inner.next_var.fetch_add(1, Ordering::Relaxed))
    }

    fn push_sync(&self, op: OpDescriptor) -> Result<()> {
        if op.is_async() {
            let err = EngineError::AsyncBodyInSyncPush;
            error!(name = op.display_name(), "{err}");
            return Err(err);
        }
        self.inner.submit(op, true)
    }

    fn push_async(&self, op: OpDescriptor) -> Result<()> {
        let wait = op.wait;
        self.inner.submit(op, wait)
    }

    fn delete_variable(&self, var: Var) -> Result<()> {
        let op = OpDescriptor::barrier(Context::default())
            .writes([var])
            .property(FnProperty::DeleteVariable)
            .name(format!("delete({var})"));
        self.inner.submit(op, false)
    }

    fn wait_for_var(&self, var: Var) -> Result<()> {
        let op = OpDescriptor::barrier(Context::default())
            .reads([var])
            .name(format!("wait_for({var})"));
        self.inner.submit(op, true)?;
        match lock(&self.inner.state).take_var_failure(var) {
            Some(error) => Err(EngineError::VariableFailed { var, error }),
            None => Ok(()),
        }
    }

    fn wait_all(&self) -> Result<()> {
        self.inner.wait_all()
    }
}

impl EngineInner {
    fn submit(&self, mut op: OpDescriptor, wait: bool) -> Result<()> {
        if wait && on_lane_worker() {
            let thread = thread::current().name().unwrap_or("<unnamed>").to_string();
            let err = EngineError::WaitFromWorker { thread };
            error!(name = op.display_name(), "{err}");
            return Err(err);
        }
        if let Err(err) = op.normalize_vars() {
            error!(name = op.display_name(), "{err}");
            return Err(err);
        }

        let lane = match op.body {
            OpBody::Barrier => None,
            _ => Some(LaneKey::for_op(op.ctx, op.property, self.config.dedicated_copy_lanes)),
        };
        if let Some(key) = lane {
            self.ensure_lane(key)?;
        }

        let name = op.display_name().to_string();
        let signal = wait.then(|| Arc::new(Signal::new()));
        let (opr, ready) = {
            let mut state = lock(&self.state);
            if let Err(err) = state.check_admission(&op, lane, self.config.max_pending_per_lane) {
                drop(state);
                if err.is_contract_violation() {
                    error!(name = %name, "{err}");
                } else {
                    debug!(name = %name, "push rejected: {err}");
                }
                return Err(err);
            }
            state.register(op, lane, signal.clone())
        };
        debug!(opr, name = %name, lane = ?lane.map(|l| l.to_string()), ready, "pushed");

        if ready {
            self.dispatch(vec![opr]);
        }

        match signal {
            Some(signal) => {
                signal.wait().map_err(|error| EngineError::OperationFailed { name, error })
            }
            None => Ok(()),
        }
    }

    fn ensure_lane(&self, key: LaneKey) -> Result<()> {
        let mut registry = lock(&self.lanes);
        if registry.closed {
            return Err(EngineError::ShutDown);
        }
        if registry.lanes.contains_key(&key) {
            return Ok(());
        }
        let sink: Arc<dyn CompletionSink> = self.this.upgrade().ok_or(EngineError::ShutDown)?;
        let lane = Lane::spawn(key, &self.config, Arc::clone(&self.provider), sink)?;
        registry.lanes.insert(key, lane);
        Ok(())
    }

    /// Move ready operations onward until nothing else becomes ready inline.
    fn dispatch(&self, ready: Vec<OprId>) {
        let mut queue: VecDeque<OprId> = ready.into();
        while let Some(opr) = queue.pop_front() {
            let next = lock(&self.state).take_ready(opr);
            match next {
                Some(Dispatch::Run { lane, op }) => {
                    let rejected = match lock(&self.lanes).lanes.get(&lane) {
                        Some(l) => l.enqueue(op).err(),
                        None => Some(op),
                    };
                    if rejected.is_some() {
                        warn!(opr, %lane, "lane closed before dispatch");
                        drop(rejected);
                        let closed = OpError::msg(format!("lane {lane} is closed"));
                        queue.extend(self.retire(opr, Err(closed)));
                    }
                }
                Some(Dispatch::Inline(result)) => queue.extend(self.retire(opr, result)),
                None => warn!(opr, "dispatch of unknown operation"),
            }
        }
    }

    /// Completion point: fire cleanup, release grants, notify observers,
    /// then wake the pusher. Returns operations that became ready.
    fn retire(&self, opr: OprId, result: std::result::Result<(), OpError>) -> Vec<OprId> {
        let cleanup = lock(&self.state).take_cleanup(opr);
        if let Some(mut cleanup) = cleanup {
            if panic::catch_unwind(AssertUnwindSafe(|| cleanup.fire())).is_err() {
                error!(opr, "cleanup action panicked");
            }
        }

        let Some(finished) = lock(&self.state).finish(opr, result) else {
            warn!(opr, "completion for unknown operation");
            return Vec::new();
        };
        if finished.drained {
            self.drained.notify_all();
        }

        let record = &finished.record;
        match &record.status {
            OpStatus::Completed => trace!(opr, name = %record.name, "completed"),
            OpStatus::Failed(err) => warn!(opr, name = %record.name, "operation failed: {err}"),
            OpStatus::Skipped(err) => debug!(opr, name = %record.name, "operation skipped: {err}"),
        }

        for observer in &self.observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer.on_outcome(record))).is_err() {
                error!(opr, name = %record.name, "outcome observer panicked");
            }
        }
        if let Some(signal) = &finished.signal {
            signal.set(finished.result.clone());
        }
        finished.ready
    }

    fn wait_all(&self) -> Result<()> {
        if on_lane_worker() {
            let thread = thread::current().name().unwrap_or("<unnamed>").to_string();
            let err = EngineError::WaitFromWorker { thread };
            error!("{err}");
            return Err(err);
        }
        let mut state = lock(&self.state);
        while state.pending() > 0 {
            state = wait(&self.drained, state);
        }
        match state.halted().iter().next() {
            Some((lane, error)) => {
                Err(EngineError::LaneHalted { lane: *lane, error: error.clone() })
            }
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.state).stop_accepting();

        if on_lane_worker() {
            warn!("engine shut down from a lane worker; pending work is not drained");
        } else {
            let mut state = lock(&self.state);
            while state.pending() > 0 {
                state = wait(&self.drained, state);
            }
        }

        let mut lanes: Vec<Lane> = {
            let mut registry = lock(&self.lanes);
            registry.closed = true;
            registry.lanes.drain().map(|(_, lane)| lane).collect()
        };
        for lane in &lanes {
            lane.close();
        }
        for lane in &mut lanes {
            lane.join();
        }
        info!(lanes = lanes.len(), "engine shut down");
    }

    fn stats(&self) -> EngineStats {
        let lanes: Vec<(LaneKey, usize, usize)> = lock(&self.lanes)
            .lanes
            .values()
            .map(|lane| (lane.key(), lane.worker_count(), lane.queued()))
            .collect();

        let state = lock(&self.state);
        let counters = state.counters();
        let mut lane_stats: Vec<LaneStats> = lanes
            .into_iter()
            .map(|(key, workers, queued)| LaneStats {
                lane: key.to_string(),
                class: key.class,
                workers,
                queued,
                pending: state.lane_pending(&key),
            })
            .collect();
        lane_stats.sort_by(|a, b| a.lane.cmp(&b.lane));

        EngineStats {
            pushed: counters.pushed,
            completed: counters.completed,
            failed: counters.failed,
            skipped: counters.skipped,
            pending: state.pending(),
            live_variables: state.live_variables(),
            lanes: lane_stats,
            halted_lanes: state.halted().keys().map(ToString::to_string).collect(),
        }
    }
}

impl CompletionSink for EngineInner {
    fn complete(&self, opr: OprId, result: std::result::Result<(), OpError>) {
        let ready = self.retire(opr, result);
        self.dispatch(ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> Engine {
        Engine::new(EngineConfig { cpu_worker_threads: 2, ..Default::default() }).unwrap()
    }

    #[test]
    fn sync_push_runs_before_returning() {
        let engine = engine();
        let var = engine.new_variable();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        engine
            .push_sync(OpDescriptor::new_sync(Context::cpu(0), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .writes([var]))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.var_version(var), 1);
        assert_eq!(engine.var_access(var), VarAccess::Idle);
    }

    #[test]
    fn push_sync_rejects_async_body() {
        let engine = engine();
        let err = engine
            .push_sync(OpDescriptor::new_async(Context::cpu(0), |_, done| done.complete()))
            .unwrap_err();
        assert!(matches!(err, EngineError::AsyncBodyInSyncPush));
    }

    #[test]
    fn variables_are_distinct() {
        let engine = engine();
        let a = engine.new_variable();
        let b = engine.new_variable();
        assert_ne!(a, b);
        assert_eq!(engine.var_version(a), 0);
    }

    #[test]
    fn push_after_shutdown_is_rejected() {
        let engine = engine();
        engine.shutdown();
        let err =
            engine.push_async(OpDescriptor::new_sync(Context::cpu(0), |_| Ok(()))).unwrap_err();
        assert!(matches!(err, EngineError::ShutDown));
        // Idempotent.
        engine.shutdown();
    }

    #[test]
    fn waited_failure_is_returned_to_pusher() {
        let engine = engine();
        let err = engine
            .push_sync(
                OpDescriptor::new_sync(Context::cpu(0), |_| anyhow::bail!("bad input"))
                    .name("parse"),
            )
            .unwrap_err();
        match err {
            EngineError::OperationFailed { name, error } => {
                assert_eq!(name, "parse");
                assert!(error.to_string().contains("bad input"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn stats_count_outcomes() {
        let engine = engine();
        engine.push_sync(OpDescriptor::new_sync(Context::cpu(0), |_| Ok(()))).unwrap();
        let _ = engine.push_sync(OpDescriptor::new_sync(Context::cpu(0), |_| anyhow::bail!("x")));
        engine.wait_all().unwrap();
        let stats = engine.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.lanes.len(), 1);
        assert_eq!(stats.lanes[0].lane, "cpu(0)/compute");
        assert_eq!(stats.lanes[0].workers, 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Engine::new(EngineConfig { bulk_size: 0, ..Default::default() }).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
