//! Operation descriptors: a unit of work plus its declared resource usage.

use std::collections::HashSet;
use std::fmt;

use crate::completion::Completion;
use crate::context::{Context, FnProperty, RunContext};
use crate::error::{EngineError, Result};
use crate::var::Var;

/// Identity of a pushed operation. Increases with submission order.
pub type OprId = u64;

/// Body of a synchronous operation: finished when it returns.
pub type SyncFn = Box<dyn FnOnce(&RunContext) -> anyhow::Result<()> + Send + 'static>;

/// Body of an asynchronous operation: finished when the [`Completion`] fires.
pub type AsyncFn = Box<dyn FnOnce(&RunContext, Completion) + Send + 'static>;

pub(crate) enum OpBody {
    Sync(SyncFn),
    Async(AsyncFn),
    /// Engine-internal marker op: completes as soon as it is granted.
    Barrier,
}

impl OpBody {
    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async(_) => "async",
            Self::Barrier => "barrier",
        }
    }
}

/// Cleanup action for an operation's parameter block.
///
/// Fires at most once: explicitly at the completion point, or on drop when
/// the owning descriptor is rejected or never executed.
pub(crate) struct Cleanup(Option<Box<dyn FnOnce() + Send + 'static>>);

impl Cleanup {
    pub(crate) const fn none() -> Self {
        Self(None)
    }

    pub(crate) fn fire(&mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.fire();
    }
}

/// A unit of work, its declared variables, and its scheduling hints.
///
/// ```
/// use ndengine::{Context, Engine, EngineConfig, OpDescriptor, Scheduler};
///
/// let engine = Engine::new(EngineConfig { cpu_worker_threads: 2, ..Default::default() }).unwrap();
/// let var = engine.new_variable();
/// let op = OpDescriptor::new_sync(Context::cpu(0), |_rctx| Ok(()))
///     .writes([var])
///     .name("touch");
/// engine.push_sync(op).unwrap();
/// ```
pub struct OpDescriptor {
    pub(crate) body: OpBody,
    pub(crate) cleanup: Cleanup,
    pub(crate) ctx: Context,
    pub(crate) const_vars: Vec<Var>,
    pub(crate) mutable_vars: Vec<Var>,
    pub(crate) property: FnProperty,
    pub(crate) priority: i32,
    pub(crate) name: Option<String>,
    pub(crate) wait: bool,
}

impl OpDescriptor {
    fn with_body(ctx: Context, body: OpBody) -> Self {
        Self {
            body,
            cleanup: Cleanup::none(),
            ctx,
            const_vars: Vec::new(),
            mutable_vars: Vec::new(),
            property: FnProperty::Normal,
            priority: 0,
            name: None,
            wait: false,
        }
    }

    /// Operation whose work is done when `f` returns.
    pub fn new_sync<F>(ctx: Context, f: F) -> Self
    where
        F: FnOnce(&RunContext) -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_body(ctx, OpBody::Sync(Box::new(f)))
    }

    /// Operation whose work is done when the [`Completion`] passed to `f` fires.
    pub fn new_async<F>(ctx: Context, f: F) -> Self
    where
        F: FnOnce(&RunContext, Completion) + Send + 'static,
    {
        Self::with_body(ctx, OpBody::Async(Box::new(f)))
    }

    pub(crate) fn barrier(ctx: Context) -> Self {
        Self::with_body(ctx, OpBody::Barrier)
    }

    /// Declare read-only variables.
    #[must_use]
    pub fn reads(mut self, vars: impl IntoIterator<Item = Var>) -> Self {
        self.const_vars.extend(vars);
        self
    }

    /// Declare mutable variables.
    #[must_use]
    pub fn writes(mut self, vars: impl IntoIterator<Item = Var>) -> Self {
        self.mutable_vars.extend(vars);
        self
    }

    #[must_use]
    pub fn property(mut self, property: FnProperty) -> Self {
        self.property = property;
        self
    }

    /// Dispatch priority within a lane; higher runs first.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Block the pushing thread until the operation completes.
    #[must_use]
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Action run exactly once when the operation's parameters are released.
    #[must_use]
    pub fn on_cleanup<F>(mut self, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = Cleanup(Some(Box::new(action)));
        self
    }

    pub fn context(&self) -> Context {
        self.ctx
    }

    pub fn const_vars(&self) -> &[Var] {
        &self.const_vars
    }

    pub fn mutable_vars(&self) -> &[Var] {
        &self.mutable_vars
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }

    pub fn is_async(&self) -> bool {
        matches!(self.body, OpBody::Async(_))
    }

    /// Collapse duplicate declarations and reject read/write overlap.
    pub(crate) fn normalize_vars(&mut self) -> Result<()> {
        dedup_in_order(&mut self.const_vars);
        dedup_in_order(&mut self.mutable_vars);

        let mutable: HashSet<Var> = self.mutable_vars.iter().copied().collect();
        if let Some(&var) = self.const_vars.iter().find(|v| mutable.contains(v)) {
            return Err(EngineError::OverlappingVariables { var });
        }
        Ok(())
    }
}

impl fmt::Debug for OpDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDescriptor")
            .field("name", &self.display_name())
            .field("body", &self.body.kind())
            .field("ctx", &self.ctx)
            .field("const_vars", &self.const_vars)
            .field("mutable_vars", &self.mutable_vars)
            .field("property", &self.property)
            .field("priority", &self.priority)
            .field("wait", &self.wait)
            .finish()
    }
}

fn dedup_in_order(vars: &mut Vec<Var>) {
    let mut seen = HashSet::with_capacity(vars.len());
    vars.retain(|v| seen.insert(*v));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> OpDescriptor {
        OpDescriptor::new_sync(Context::cpu(0), |_| Ok(()))
    }

    #[test]
    fn builder_defaults() {
        let op = noop();
        assert_eq!(op.property, FnProperty::Normal);
        assert_eq!(op.priority, 0);
        assert!(!op.wait);
        assert_eq!(op.display_name(), "anonymous");
        assert!(!op.is_async());
    }

    #[test]
    fn normalize_collapses_duplicates_in_order() {
        let (a, b) = (Var::from_id(1), Var::from_id(2));
        let mut op = noop().reads([b, a, b]).writes([Var::from_id(3), Var::from_id(3)]);
        op.normalize_vars().unwrap();
        assert_eq!(op.const_vars(), &[b, a]);
        assert_eq!(op.mutable_vars(), &[Var::from_id(3)]);
    }

    #[test]
    fn normalize_rejects_overlap() {
        let a = Var::from_id(1);
        let mut op = noop().reads([a]).writes([a]);
        let err = op.normalize_vars().unwrap_err();
        assert!(matches!(err, EngineError::OverlappingVariables { var } if var == a));
    }

    #[test]
    fn cleanup_fires_once_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let op = noop().on_cleanup(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        drop(op);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_fire_disarms_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let mut cleanup = Cleanup(Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        cleanup.fire();
        cleanup.fire();
        drop(cleanup);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_shows_name_and_kind() {
        let op = OpDescriptor::new_async(Context::gpu(1), |_, done| done.complete()).name("copy");
        let dbg = format!("{op:?}");
        assert!(dbg.contains("copy"));
        assert!(dbg.contains("async"));
    }
}
