//! Variables: the unit of dependency tracking.
//!
//! Each variable keeps a FIFO queue of pending accesses. Consecutive reads at
//! the head of the queue are granted together; a write is granted only once
//! every earlier grant on the variable has been released. Grants on a single
//! variable are therefore issued in submission order.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::error::OpError;
use crate::operation::OprId;

/// Numeric identity of a [`Var`].
pub type VarId = u64;

/// Opaque token naming a resource whose accesses the engine serialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var {
    id: VarId,
}

impl Var {
    pub(crate) const fn from_id(id: VarId) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> VarId {
        self.id
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var#{}", self.id)
    }
}

/// Snapshot of a variable's current grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAccess {
    Idle,
    Read(usize),
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Read,
    Write,
}

#[derive(Debug)]
struct PendingAccess {
    opr: OprId,
    mode: AccessMode,
}

/// Dependency state of one variable.
#[derive(Debug, Default)]
pub(crate) struct VarState {
    queue: VecDeque<PendingAccess>,
    active_reads: usize,
    active_write: bool,
    version: u64,
    delete_pending: bool,
    failure: Option<OpError>,
}

impl VarState {
    /// Queue an access and return the operations granted as a result.
    pub(crate) fn enqueue(&mut self, opr: OprId, mode: AccessMode) -> Vec<OprId> {
        self.queue.push_back(PendingAccess { opr, mode });
        self.pump()
    }

    /// Release one grant of `mode` and return the operations granted next.
    pub(crate) fn release(&mut self, mode: AccessMode) -> Vec<OprId> {
        match mode {
            AccessMode::Read => {
                debug_assert!(self.active_reads > 0, "read released without a grant");
                self.active_reads = self.active_reads.saturating_sub(1);
            }
            AccessMode::Write => {
                debug_assert!(self.active_write, "write released without a grant");
                self.active_write = false;
                self.version += 1;
            }
        }
        self.pump()
    }

    fn pump(&mut self) -> Vec<OprId> {
        let mut granted = Vec::new();
        while let Some(front) = self.queue.front() {
            match front.mode {
                AccessMode::Read if !self.active_write => {
                    self.active_reads += 1;
                    granted.push(front.opr);
                    self.queue.pop_front();
                }
                AccessMode::Write if !self.active_write && self.active_reads == 0 => {
                    self.active_write = true;
                    granted.push(front.opr);
                    self.queue.pop_front();
                    break;
                }
                _ => break,
            }
        }
        granted
    }

    pub(crate) fn access(&self) -> VarAccess {
        if self.active_write {
            VarAccess::Write
        } else if self.active_reads > 0 {
            VarAccess::Read(self.active_reads)
        } else {
            VarAccess::Idle
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.active_reads == 0 && !self.active_write
    }

    pub(crate) fn mark_delete_pending(&mut self) {
        self.delete_pending = true;
    }

    pub(crate) fn is_delete_pending(&self) -> bool {
        self.delete_pending
    }

    pub(crate) fn failure(&self) -> Option<&OpError> {
        self.failure.as_ref()
    }

    pub(crate) fn set_failure(&mut self, error: OpError) {
        self.failure = Some(error);
    }

    pub(crate) fn clear_failure(&mut self) -> Option<OpError> {
        self.failure.take()
    }
}

/// Ids of deleted variables, stored as disjoint half-open ranges.
///
/// Ids come from a monotonic counter, so arrays freed in any order coalesce
/// into few ranges. Memory grows only with the number of gaps between them.
#[derive(Debug, Default)]
pub(crate) struct Tombstones {
    ranges: BTreeMap<VarId, VarId>,
}

impl Tombstones {
    pub(crate) fn contains(&self, id: VarId) -> bool {
        self.ranges.range(..=id).next_back().is_some_and(|(_, &end)| id < end)
    }

    pub(crate) fn insert(&mut self, id: VarId) {
        if self.contains(id) {
            return;
        }
        let (mut start, mut end) = (id, id + 1);
        if let Some((&s, &e)) = self.ranges.range(..id).next_back() {
            if e == id {
                start = s;
            }
        }
        if let Some(e) = self.ranges.remove(&end) {
            end = e;
        }
        self.ranges.insert(start, end);
    }

    #[cfg(test)]
    pub(crate) fn range_count(&self) -> usize {
        self.ranges.len()
    }
}
