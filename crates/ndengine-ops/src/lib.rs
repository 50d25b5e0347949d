//! Array resources and element-wise operations pushed through a [`Scheduler`].
//!
//! Nothing here knows about the concrete engine: every operation is written
//! against `&dyn Scheduler`, so tests and tools can inject any implementation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use ndengine::{Context, OpDescriptor, Result, Scheduler, Var};
use tracing::{debug, trace};

type Storage = Arc<Mutex<Vec<f32>>>;

fn storage(data: &Storage) -> MutexGuard<'_, Vec<f32>> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A host `f32` array whose accesses are ordered by an engine variable.
///
/// Cloning yields another handle to the same storage and variable.
#[derive(Clone)]
pub struct NdArray {
    var: Var,
    ctx: Context,
    data: Storage,
}

impl NdArray {
    pub fn new(scheduler: &dyn Scheduler, values: &[f32]) -> Self {
        Self::with_context(scheduler, Context::cpu(0), values)
    }

    pub fn with_context(scheduler: &dyn Scheduler, ctx: Context, values: &[f32]) -> Self {
        Self { var: scheduler.new_variable(), ctx, data: Arc::new(Mutex::new(values.to_vec())) }
    }

    pub fn var(&self) -> Var {
        self.var
    }

    pub fn context(&self) -> Context {
        self.ctx
    }

    pub fn len(&self) -> usize {
        storage(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("var", &self.var)
            .field("ctx", &self.ctx)
            .field("len", &self.len())
            .finish()
    }
}

/// Parameter block captured by an element-wise operation.
struct AddParams {
    data: Storage,
    value: f32,
}

impl AddParams {
    fn apply(&self) {
        for x in storage(&self.data).iter_mut() {
            *x += self.value;
        }
    }
}

/// Element-wise operations on [`NdArray`]s.
pub struct ArrayOps<'a> {
    scheduler: &'a dyn Scheduler,
}

impl<'a> ArrayOps<'a> {
    pub fn new(scheduler: &'a dyn Scheduler) -> Self {
        Self { scheduler }
    }

    /// Add one to every element; returns once the update has run.
    pub fn add_one(&self, array: &NdArray) -> Result<()> {
        let params = AddParams { data: Arc::clone(&array.data), value: 1.0 };
        debug!(var = %array.var, "add_one");
        let op = OpDescriptor::new_sync(array.ctx, move |_rctx| {
            params.apply();
            Ok(())
        })
        .writes([array.var])
        .name("add_one")
        .on_cleanup(|| trace!("add_one params released"));
        self.scheduler.push_sync(op)
    }

    /// Add one to every element without waiting for it to happen.
    pub fn add_one_async(&self, array: &NdArray) -> Result<()> {
        let params = AddParams { data: Arc::clone(&array.data), value: 1.0 };
        debug!(var = %array.var, "add_one_async");
        let op = OpDescriptor::new_async(array.ctx, move |_rctx, done| {
            params.apply();
            done.complete();
        })
        .writes([array.var])
        .name("add_one_async")
        .on_cleanup(|| trace!("add_one_async params released"));
        self.scheduler.push_async(op)
    }

    /// Add `value` to every element from a helper thread after `delay`.
    ///
    /// The operation stays in flight, holding the array, until the helper
    /// fires its completion token.
    pub fn add_scalar_async(&self, array: &NdArray, value: f32, delay: Duration) -> Result<()> {
        let params = AddParams { data: Arc::clone(&array.data), value };
        let op = OpDescriptor::new_async(array.ctx, move |_rctx, done| {
            thread::spawn(move || {
                thread::sleep(delay);
                params.apply();
                done.complete();
            });
        })
        .writes([array.var])
        .name("add_scalar_async");
        self.scheduler.push_async(op)
    }

    /// `dst += src` element-wise. Reads `src`, writes `dst`; `src` may be `dst`.
    pub fn accumulate(&self, dst: &NdArray, src: &NdArray) -> Result<()> {
        let reads: Vec<Var> = if src.var == dst.var { Vec::new() } else { vec![src.var] };
        let (out, input) = (Arc::clone(&dst.data), Arc::clone(&src.data));
        let op = OpDescriptor::new_sync(dst.ctx, move |_rctx| {
            let input = storage(&input).clone();
            let mut out = storage(&out);
            anyhow::ensure!(
                out.len() == input.len(),
                "length mismatch: destination has {} elements, source {}",
                out.len(),
                input.len()
            );
            for (o, i) in out.iter_mut().zip(&input) {
                *o += *i;
            }
            Ok(())
        })
        .reads(reads)
        .writes([dst.var])
        .name("accumulate");
        self.scheduler.push_async(op)
    }

    /// Wait for every pending write to `array`, then copy its contents out.
    pub fn read(&self, array: &NdArray) -> Result<Vec<f32>> {
        self.scheduler.wait_for_var(array.var)?;
        Ok(storage(&array.data).clone())
    }

    /// Delete the array's variable once its pending accesses drain.
    pub fn free(&self, array: NdArray) -> Result<()> {
        self.scheduler.delete_variable(array.var)
    }

    pub fn wait_all(&self) -> Result<()> {
        self.scheduler.wait_all()
    }
}
