//! Engine error types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::lane::LaneKey;
use crate::var::Var;

/// Failure reported by an operation body.
///
/// Cheap to clone so a single failure can be handed to a waiter, every
/// observer, and each variable it taints.
#[derive(Clone)]
pub struct OpError {
    inner: Arc<anyhow::Error>,
}

impl OpError {
    pub fn new(err: anyhow::Error) -> Self {
        Self { inner: Arc::new(err) }
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(message))
    }

    /// Whether two handles refer to the same reported failure.
    pub fn same_failure(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<anyhow::Error> for OpError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl fmt::Debug for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("variable {var} declared both read-only and mutable")]
    OverlappingVariables { var: Var },

    #[error("variable {var} used after deletion")]
    DeletedVariable { var: Var },

    #[error("push_sync requires a synchronous operation body")]
    AsyncBodyInSyncPush,

    #[error("cannot block on the engine from lane worker thread `{thread}`")]
    WaitFromWorker { thread: String },

    #[error("lane {lane} queue full (limit {limit})")]
    QueueFull { lane: LaneKey, limit: usize },

    #[error("lane {lane} halted after failure: {error}")]
    LaneHalted { lane: LaneKey, error: OpError },

    #[error("engine is shut down")]
    ShutDown,

    #[error("operation `{name}` failed: {error}")]
    OperationFailed { name: String, error: OpError },

    #[error("variable {var} carries a failed operation: {error}")]
    VariableFailed { var: Var, error: OpError },

    #[error("failed to spawn worker for lane {lane}: {source}")]
    WorkerSpawn {
        lane: LaneKey,
        #[source]
        source: std::io::Error,
    },

    #[error("stream provider failed for lane {lane}: {error}")]
    StreamProvider { lane: LaneKey, error: OpError },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Programming errors on the caller's side: the push itself was invalid.
    pub const fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::OverlappingVariables { .. }
                | Self::DeletedVariable { .. }
                | Self::AsyncBodyInSyncPush
                | Self::WaitFromWorker { .. }
        )
    }

    /// The operation failure carried by this error, if any.
    pub fn op_error(&self) -> Option<&OpError> {
        match self {
            Self::OperationFailed { error, .. }
            | Self::VariableFailed { error, .. }
            | Self::LaneHalted { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
