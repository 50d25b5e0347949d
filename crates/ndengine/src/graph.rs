//! Dependency graph state shared by every push, dispatch, and completion.
//!
//! All of it lives behind one engine mutex. Nothing here runs user code:
//! bodies execute on lanes and cleanup actions are taken out and fired by
//! the caller with the lock released.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{trace, warn};

use crate::completion::Signal;
use crate::config::FailurePolicy;
use crate::context::{Context, FnProperty};
use crate::error::{EngineError, OpError, Result};
use crate::lane::{LaneKey, ReadyOp, Work};
use crate::operation::{Cleanup, OpBody, OpDescriptor, OprId};
use crate::outcome::{OpRecord, OpStatus};
use crate::var::{AccessMode, Tombstones, Var, VarAccess, VarId, VarState};

/// In-flight operation.
struct OprEntry {
    name: String,
    lane: Option<LaneKey>,
    ctx: Context,
    property: FnProperty,
    priority: i32,
    const_vars: Vec<Var>,
    mutable_vars: Vec<Var>,
    body: Option<OpBody>,
    cleanup: Option<Cleanup>,
    /// Ungranted variables plus the registration guard.
    wait_count: usize,
    signal: Option<Arc<Signal>>,
    pushed_at: Instant,
    skipped: bool,
}

/// What to do with an operation whose dependencies are all granted.
pub(crate) enum Dispatch {
    /// Hand to the lane's workers.
    Run { lane: LaneKey, op: ReadyOp },
    /// Complete without touching a lane (barriers and skipped operations).
    Inline(std::result::Result<(), OpError>),
}

/// Result of retiring an operation.
pub(crate) struct Finished {
    pub(crate) ready: Vec<OprId>,
    pub(crate) signal: Option<Arc<Signal>>,
    pub(crate) result: std::result::Result<(), OpError>,
    pub(crate) record: OpRecord,
    pub(crate) drained: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub(crate) pushed: u64,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) skipped: u64,
}

pub(crate) struct SchedState {
    policy: FailurePolicy,
    next_opr: OprId,
    vars: HashMap<VarId, VarState>,
    deleted: Tombstones,
    oprs: HashMap<OprId, OprEntry>,
    lane_pending: HashMap<LaneKey, usize>,
    halted: BTreeMap<LaneKey, OpError>,
    pending: usize,
    accepting: bool,
    counters: Counters,
}

impl SchedState {
    pub(crate) fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            next_opr: 0,
            vars: HashMap::new(),
            deleted: Tombstones::default(),
            oprs: HashMap::new(),
            lane_pending: HashMap::new(),
            halted: BTreeMap::new(),
            pending: 0,
            accepting: true,
            counters: Counters::default(),
        }
    }

    // ── Push ────────────────────────────────────────────────────────

    /// Reject a push that references deleted variables, targets a halted
    /// lane, or would overflow the lane's pending limit.
    pub(crate) fn check_admission(
        &self,
        desc: &OpDescriptor,
        lane: Option<LaneKey>,
        limit: usize,
    ) -> Result<()> {
        if !self.accepting {
            return Err(EngineError::ShutDown);
        }
        for &var in desc.const_vars.iter().chain(&desc.mutable_vars) {
            let deleted = self.deleted.contains(var.id())
                || self.vars.get(&var.id()).is_some_and(VarState::is_delete_pending);
            if deleted {
                return Err(EngineError::DeletedVariable { var });
            }
        }
        if let Some(lane) = lane {
            if !desc.property.never_skipped() {
                if let Some(error) = self.halted.get(&lane) {
                    return Err(EngineError::LaneHalted { lane, error: error.clone() });
                }
            }
            if self.lane_pending.get(&lane).copied().unwrap_or(0) >= limit {
                return Err(EngineError::QueueFull { lane, limit });
            }
        }
        Ok(())
    }

    /// Append an admitted operation to its variables' queues.
    ///
    /// Returns its id and whether every access was granted on the spot.
    pub(crate) fn register(
        &mut self,
        desc: OpDescriptor,
        lane: Option<LaneKey>,
        signal: Option<Arc<Signal>>,
    ) -> (OprId, bool) {
        let OpDescriptor {
            body, cleanup, ctx, const_vars, mutable_vars, property, priority, name, ..
        } = desc;

        let opr = self.next_opr;
        self.next_opr += 1;

        // The extra 1 keeps the op from going ready while its accesses are
        // still being appended.
        let mut wait_count = const_vars.len() + mutable_vars.len() + 1;

        for &var in &const_vars {
            if self.enqueue_access(opr, var, AccessMode::Read) {
                wait_count -= 1;
            }
        }
        for &var in &mutable_vars {
            if property == FnProperty::DeleteVariable {
                self.vars.entry(var.id()).or_default().mark_delete_pending();
            }
            if self.enqueue_access(opr, var, AccessMode::Write) {
                wait_count -= 1;
            }
        }
        wait_count -= 1;

        self.oprs.insert(
            opr,
            OprEntry {
                name: name.unwrap_or_else(|| format!("op#{opr}")),
                lane,
                ctx,
                property,
                priority,
                const_vars,
                mutable_vars,
                body: Some(body),
                cleanup: Some(cleanup),
                wait_count,
                signal,
                pushed_at: Instant::now(),
                skipped: false,
            },
        );

        if let Some(lane) = lane {
            *self.lane_pending.entry(lane).or_insert(0) += 1;
        }
        self.pending += 1;
        self.counters.pushed += 1;

        (opr, wait_count == 0)
    }

    /// Queue one access. True if it was granted immediately.
    fn enqueue_access(&mut self, opr: OprId, var: Var, mode: AccessMode) -> bool {
        let granted = self.vars.entry(var.id()).or_default().enqueue(opr, mode);
        // A fresh tail entry can only grant itself.
        debug_assert!(granted.iter().all(|&g| g == opr));
        if granted.is_empty() {
            return false;
        }
        trace!(opr, %var, ?mode, "granted at push");
        true
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Take a ready operation's body and decide how it proceeds.
    pub(crate) fn take_ready(&mut self, opr: OprId) -> Option<Dispatch> {
        let skip = self.skip_reason(opr);
        let entry = self.oprs.get_mut(&opr)?;
        let body = entry.body.take()?;

        let work = match (body, skip) {
            (OpBody::Barrier, _) => return Some(Dispatch::Inline(Ok(()))),
            (_, Some(err)) => {
                entry.skipped = true;
                return Some(Dispatch::Inline(Err(err)));
            }
            (OpBody::Sync(f), None) => Work::Sync(f),
            (OpBody::Async(f), None) => Work::Async(f),
        };
        let Some(lane) = entry.lane else {
            return Some(Dispatch::Inline(Err(OpError::msg("operation has no lane"))));
        };
        Some(Dispatch::Run {
            lane,
            op: ReadyOp {
                opr,
                ctx: entry.ctx,
                name: entry.name.clone(),
                boost: lane.boosts(entry.property),
                priority: entry.priority,
                work,
            },
        })
    }

    fn skip_reason(&self, opr: OprId) -> Option<OpError> {
        let entry = self.oprs.get(&opr)?;
        if entry.property.never_skipped() {
            return None;
        }
        match self.policy {
            FailurePolicy::LogAndContinue => None,
            FailurePolicy::SkipDependents => entry
                .const_vars
                .iter()
                .chain(&entry.mutable_vars)
                .find_map(|var| self.vars.get(&var.id()).and_then(VarState::failure).cloned()),
            FailurePolicy::HaltLane => entry.lane.and_then(|lane| self.halted.get(&lane).cloned()),
        }
    }

    // ── Completion ──────────────────────────────────────────────────

    /// Take the cleanup action so it can fire outside the lock.
    pub(crate) fn take_cleanup(&mut self, opr: OprId) -> Option<Cleanup> {
        self.oprs.get_mut(&opr).and_then(|entry| entry.cleanup.take())
    }

    /// Retire an operation: release its grants, apply the failure policy,
    /// and delete its variables if it was a deleter.
    pub(crate) fn finish(
        &mut self,
        opr: OprId,
        result: std::result::Result<(), OpError>,
    ) -> Option<Finished> {
        let entry = self.oprs.remove(&opr)?;
        let mut granted = Vec::new();

        for &var in &entry.const_vars {
            if let Some(state) = self.vars.get_mut(&var.id()) {
                granted.extend(state.release(AccessMode::Read));
            }
        }
        for &var in &entry.mutable_vars {
            if let Some(state) = self.vars.get_mut(&var.id()) {
                match (&result, self.policy) {
                    (Err(err), FailurePolicy::SkipDependents) => state.set_failure(err.clone()),
                    (Ok(()), _) => {
                        state.clear_failure();
                    }
                    _ => {}
                }
                granted.extend(state.release(AccessMode::Write));
            }
        }

        if let (Err(err), Some(lane)) = (&result, entry.lane) {
            let halt = self.policy == FailurePolicy::HaltLane;
            if halt && !entry.skipped && !self.halted.contains_key(&lane) {
                warn!(%lane, opr, name = %entry.name, "halting lane after failure");
                self.halted.insert(lane, err.clone());
            }
        }

        if entry.property == FnProperty::DeleteVariable {
            for &var in &entry.mutable_vars {
                if self.vars.remove(&var.id()).is_some_and(|state| !state.is_drained()) {
                    warn!(%var, "deleted variable still had queued accesses");
                }
                self.deleted.insert(var.id());
                trace!(%var, "variable deleted");
            }
        }

        let mut ready = Vec::new();
        for next in granted {
            trace!(opr = next, after = opr, "granted on release");
            if let Some(waiting) = self.oprs.get_mut(&next) {
                waiting.wait_count -= 1;
                if waiting.wait_count == 0 {
                    ready.push(next);
                }
            }
        }

        if let Some(lane) = entry.lane {
            if let Some(count) = self.lane_pending.get_mut(&lane) {
                *count = count.saturating_sub(1);
            }
        }
        self.pending -= 1;

        let status = match &result {
            Ok(()) => {
                self.counters.completed += 1;
                OpStatus::Completed
            }
            Err(err) if entry.skipped => {
                self.counters.skipped += 1;
                OpStatus::Skipped(err.clone())
            }
            Err(err) => {
                self.counters.failed += 1;
                OpStatus::Failed(err.clone())
            }
        };

        Some(Finished {
            ready,
            signal: entry.signal,
            result,
            record: OpRecord {
                id: opr,
                name: entry.name,
                lane: entry.lane,
                status,
                elapsed: entry.pushed_at.elapsed(),
            },
            drained: self.pending == 0,
        })
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn lane_pending(&self, lane: &LaneKey) -> usize {
        self.lane_pending.get(lane).copied().unwrap_or(0)
    }

    pub(crate) fn counters(&self) -> Counters {
        self.counters
    }

    pub(crate) fn live_variables(&self) -> usize {
        self.vars.len()
    }

    pub(crate) fn is_deleted(&self, var: Var) -> bool {
        self.deleted.contains(var.id())
    }

    pub(crate) fn var_access(&self, var: Var) -> VarAccess {
        self.vars.get(&var.id()).map_or(VarAccess::Idle, VarState::access)
    }

    pub(crate) fn var_version(&self, var: Var) -> u64 {
        self.vars.get(&var.id()).map_or(0, VarState::version)
    }

    pub(crate) fn take_var_failure(&mut self, var: Var) -> Option<OpError> {
        self.vars.get_mut(&var.id()).and_then(VarState::clear_failure)
    }

    pub(crate) fn halted(&self) -> &BTreeMap<LaneKey, OpError> {
        &self.halted
    }

    pub(crate) fn resume_lane(&mut self, lane: &LaneKey) -> Option<OpError> {
        self.halted.remove(lane)
    }

    pub(crate) fn stop_accepting(&mut self) {
        self.accepting = false;
    }
}
