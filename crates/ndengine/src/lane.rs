//! Execution lanes: per-context worker pools fed from a priority queue.
//!
//! A lane is keyed by device context and class. Ready operations are popped
//! in (boost, priority, submission) order. Workers that were handed a stream
//! run consecutive synchronous operations as a bulk and synchronise the stream
//! once at the bulk boundary.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::completion::{Completion, CompletionSink};
use crate::config::EngineConfig;
use crate::context::{Context, DeviceType, FnProperty, RunContext, StreamHandle};
use crate::error::{EngineError, OpError, Result};
use crate::operation::{AsyncFn, OprId, SyncFn};
use crate::sync::{lock, wait};

// ── Lane identity ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneClass {
    Compute,
    Copy,
}

/// Identity of an execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneKey {
    pub ctx: Context,
    pub class: LaneClass,
}

impl LaneKey {
    pub const fn new(ctx: Context, class: LaneClass) -> Self {
        Self { ctx, class }
    }

    pub const fn compute(ctx: Context) -> Self {
        Self::new(ctx, LaneClass::Compute)
    }

    /// Lane an operation with `property` on `ctx` runs on.
    ///
    /// Device copies get their own lane per GPU context so they can overlap
    /// with compute; everything else shares the context's compute lane.
    pub fn for_op(ctx: Context, property: FnProperty, dedicated_copy_lanes: bool) -> Self {
        if dedicated_copy_lanes && property.is_copy() && ctx.dev_type == DeviceType::Gpu {
            Self::new(ctx, LaneClass::Copy)
        } else {
            Self::compute(ctx)
        }
    }

    /// Whether `property` jumps the queue on this lane.
    pub fn boosts(&self, property: FnProperty) -> bool {
        match property {
            FnProperty::PriorityCpu => self.ctx.dev_type.is_cpu_kind(),
            FnProperty::PriorityGpu => self.ctx.dev_type == DeviceType::Gpu,
            _ => false,
        }
    }

    pub(crate) fn worker_count(&self, config: &EngineConfig) -> usize {
        match self.class {
            LaneClass::Copy => config.copy_worker_threads,
            LaneClass::Compute if self.ctx.dev_type.is_cpu_kind() => config.cpu_worker_threads,
            LaneClass::Compute => config.gpu_worker_threads,
        }
    }
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            LaneClass::Compute => "compute",
            LaneClass::Copy => "copy",
        };
        write!(f, "{}/{}", self.ctx, class)
    }
}

// ── Streams ─────────────────────────────────────────────────────────

/// Streams assigned to one lane worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneStreams {
    pub stream: Option<StreamHandle>,
    pub aux_stream: Option<StreamHandle>,
}

/// Source of native streams for lane workers.
///
/// Implementations wrap a device runtime. The engine asks for streams once
/// per worker when a lane is created and calls [`synchronize`] at each bulk
/// boundary and after each non-bulk synchronous operation.
///
/// [`synchronize`]: StreamProvider::synchronize
pub trait StreamProvider: Send + Sync {
    fn streams(&self, lane: &LaneKey, worker: usize) -> anyhow::Result<LaneStreams>;

    fn synchronize(&self, _lane: &LaneKey, _stream: StreamHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Provider for host-only deployments: no streams, nothing to synchronise.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStreams;

impl StreamProvider for HostStreams {
    fn streams(&self, _lane: &LaneKey, _worker: usize) -> anyhow::Result<LaneStreams> {
        Ok(LaneStreams::default())
    }
}

// ── Ready queue ─────────────────────────────────────────────────────

pub(crate) enum Work {
    Sync(SyncFn),
    Async(AsyncFn),
}

/// A granted operation waiting for a worker.
pub(crate) struct ReadyOp {
    pub(crate) opr: OprId,
    pub(crate) ctx: Context,
    pub(crate) name: String,
    pub(crate) boost: bool,
    pub(crate) priority: i32,
    pub(crate) work: Work,
}

impl ReadyOp {
    fn rank(&self) -> (bool, i32, std::cmp::Reverse<OprId>) {
        (self.boost, self.priority, std::cmp::Reverse(self.opr))
    }
}

impl PartialEq for ReadyOp {
    fn eq(&self, other: &Self) -> bool {
        self.opr == other.opr
    }
}

impl Eq for ReadyOp {}

impl PartialOrd for ReadyOp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyOp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

// ── Worker-thread marker ────────────────────────────────────────────

thread_local! {
    static ON_LANE_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on threads owned by a lane.
pub(crate) fn on_lane_worker() -> bool {
    ON_LANE_WORKER.with(Cell::get)
}

// ── Lane ────────────────────────────────────────────────────────────

struct LaneQueue {
    heap: BinaryHeap<ReadyOp>,
    closed: bool,
}

struct LaneShared {
    key: LaneKey,
    queue: Mutex<LaneQueue>,
    available: Condvar,
}

/// Everything a worker needs besides its queue.
struct WorkerEnv {
    shared: Arc<LaneShared>,
    streams: LaneStreams,
    bulk_size: usize,
    provider: Arc<dyn StreamProvider>,
    sink: Arc<dyn CompletionSink>,
}

pub(crate) struct Lane {
    shared: Arc<LaneShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Lane {
    /// Start a lane's workers.
    pub(crate) fn spawn(
        key: LaneKey,
        config: &EngineConfig,
        provider: Arc<dyn StreamProvider>,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self> {
        let shared = Arc::new(LaneShared {
            key,
            queue: Mutex::new(LaneQueue { heap: BinaryHeap::new(), closed: false }),
            available: Condvar::new(),
        });

        let count = key.worker_count(config).max(1);
        let mut lane = Self { shared, workers: Vec::with_capacity(count) };

        for index in 0..count {
            let streams = match provider.streams(&key, index) {
                Ok(streams) => streams,
                Err(err) => {
                    lane.close();
                    lane.join();
                    return Err(EngineError::StreamProvider { lane: key, error: OpError::new(err) });
                }
            };

            let env = WorkerEnv {
                shared: Arc::clone(&lane.shared),
                streams,
                bulk_size: config.bulk_size,
                provider: Arc::clone(&provider),
                sink: Arc::clone(&sink),
            };

            let name = format!("{}-{key}-{index}", config.thread_name_prefix);
            let mut builder = thread::Builder::new().name(name);
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            match builder.spawn(move || worker_loop(env)) {
                Ok(handle) => lane.workers.push(handle),
                Err(source) => {
                    lane.close();
                    lane.join();
                    return Err(EngineError::WorkerSpawn { lane: key, source });
                }
            }
        }

        debug!(lane = %key, workers = count, "lane started");
        Ok(lane)
    }

    pub(crate) fn key(&self) -> LaneKey {
        self.shared.key
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Hand a ready operation to the workers. Gives it back if the lane is closed.
    pub(crate) fn enqueue(&self, op: ReadyOp) -> std::result::Result<(), ReadyOp> {
        let mut queue = lock(&self.shared.queue);
        if queue.closed {
            return Err(op);
        }
        trace!(lane = %self.shared.key, opr = op.opr, "enqueued");
        queue.heap.push(op);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    pub(crate) fn queued(&self) -> usize {
        lock(&self.shared.queue).heap.len()
    }

    /// Stop accepting work. Workers exit once their queue is empty.
    pub(crate) fn close(&self) {
        lock(&self.shared.queue).closed = true;
        self.shared.available.notify_all();
    }

    /// Join every worker except the calling thread.
    pub(crate) fn join(&mut self) {
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(lane = %self.shared.key, "lane worker panicked");
            }
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────

fn worker_loop(env: WorkerEnv) {
    ON_LANE_WORKER.with(|flag| flag.set(true));

    let key = env.shared.key;
    let bulk_enabled = env.streams.stream.is_some() && env.bulk_size > 1;
    let mut deferred: Vec<(OprId, std::result::Result<(), OpError>)> = Vec::new();

    loop {
        let next = {
            let mut queue = lock(&env.shared.queue);
            loop {
                if let Some(op) = queue.heap.pop() {
                    break Some(op);
                }
                if !deferred.is_empty() {
                    // Nothing else to batch with; close the bulk before sleeping.
                    break None;
                }
                if queue.closed {
                    trace!(lane = %key, "worker exiting");
                    return;
                }
                queue = wait(&env.shared.available, queue);
            }
        };

        let Some(op) = next else {
            flush_bulk(&env, &mut deferred);
            continue;
        };

        let rctx = RunContext {
            ctx: op.ctx,
            stream: env.streams.stream,
            aux_stream: env.streams.aux_stream,
            is_bulk: false,
        };

        match op.work {
            Work::Sync(body) if bulk_enabled => {
                let bulk_rctx = RunContext { is_bulk: true, ..rctx };
                let result = run_sync(&key, op.opr, &op.name, body, bulk_rctx);
                deferred.push((op.opr, result));
                if deferred.len() >= env.bulk_size {
                    flush_bulk(&env, &mut deferred);
                }
            }
            Work::Sync(body) => {
                let mut result = run_sync(&key, op.opr, &op.name, body, rctx);
                if let Some(stream) = env.streams.stream {
                    if let Err(err) = env.provider.synchronize(&key, stream) {
                        result = result.and(Err(OpError::new(err)));
                    }
                }
                env.sink.complete(op.opr, result);
            }
            Work::Async(body) => {
                flush_bulk(&env, &mut deferred);
                let done = Completion::new(Arc::clone(&env.sink), op.opr);
                trace!(lane = %key, opr = op.opr, name = %op.name, "start async");
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&rctx, done))) {
                    // The token went down with the body and has already failed the op.
                    error!(
                        lane = %key,
                        opr = op.opr,
                        name = %op.name,
                        "async body panicked: {}",
                        panic_message(&*payload)
                    );
                }
            }
        }
    }
}

fn run_sync(
    key: &LaneKey,
    opr: OprId,
    name: &str,
    body: SyncFn,
    rctx: RunContext,
) -> std::result::Result<(), OpError> {
    trace!(lane = %key, opr, name, is_bulk = rctx.is_bulk, "run sync");
    match panic::catch_unwind(AssertUnwindSafe(|| body(&rctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(OpError::new(err)),
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(lane = %key, opr, name, "operation body panicked: {message}");
            Err(OpError::msg(format!("operation `{name}` panicked: {message}")))
        }
    }
}

/// Synchronise the worker's stream and complete every deferred operation.
fn flush_bulk(env: &WorkerEnv, deferred: &mut Vec<(OprId, std::result::Result<(), OpError>)>) {
    if deferred.is_empty() {
        return;
    }
    let key = env.shared.key;
    let sync_error = env
        .streams
        .stream
        .and_then(|stream| env.provider.synchronize(&key, stream).err())
        .map(OpError::new);
    if let Some(err) = &sync_error {
        warn!(lane = %key, ops = deferred.len(), "stream synchronisation failed: {err}");
    }
    trace!(lane = %key, ops = deferred.len(), "bulk flushed");

    for (opr, result) in deferred.drain(..) {
        let result = match &sync_error {
            Some(err) => result.and(Err(err.clone())),
            None => result,
        };
        env.sink.complete(opr, result);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
