//! Operation outcome reporting.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::OpError;
use crate::lane::LaneKey;
use crate::operation::OprId;
use crate::sync::lock;

#[derive(Debug, Clone)]
pub enum OpStatus {
    Completed,
    Failed(OpError),
    /// Never ran; carries the failure that caused the skip.
    Skipped(OpError),
}

impl OpStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn error(&self) -> Option<&OpError> {
        match self {
            Self::Completed => None,
            Self::Failed(err) | Self::Skipped(err) => Some(err),
        }
    }
}

/// Final record of one operation.
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub id: OprId,
    pub name: String,
    /// `None` for engine-internal operations that never touch a lane.
    pub lane: Option<LaneKey>,
    pub status: OpStatus,
    /// Time from push to completion.
    pub elapsed: Duration,
}

/// Receives a record for every finished operation.
///
/// Called on whichever thread completed the operation, with no engine lock
/// held. Implementations must not block on the engine.
pub trait OutcomeObserver: Send + Sync {
    fn on_outcome(&self, record: &OpRecord);
}

impl<F> OutcomeObserver for F
where
    F: Fn(&OpRecord) + Send + Sync,
{
    fn on_outcome(&self, record: &OpRecord) {
        self(record)
    }
}

/// Observer that keeps every record in memory.
#[derive(Debug, Default)]
pub struct OutcomeLog {
    records: Mutex<Vec<OpRecord>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OpRecord> {
        lock(&self.records).clone()
    }

    pub fn failures(&self) -> Vec<OpRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| matches!(r.status, OpStatus::Failed(_)))
            .cloned()
            .collect()
    }

    pub fn skipped(&self) -> Vec<OpRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| matches!(r.status, OpStatus::Skipped(_)))
            .cloned()
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<OpRecord> {
        lock(&self.records).iter().find(|r| r.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutcomeObserver for OutcomeLog {
    fn on_outcome(&self, record: &OpRecord) {
        lock(&self.records).push(record.clone());
    }
}
