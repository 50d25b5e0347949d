//! Dependency-aware execution engine.
//!
//! Operations declare the [`Var`]s they read and write. The engine grants
//! access per variable in submission order, batching consecutive readers,
//! and runs each operation on the lane for its device context once all of
//! its accesses are granted. Asynchronous operations finish through a
//! one-shot [`Completion`] token.

pub mod completion;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
mod graph;
pub mod lane;
pub mod operation;
pub mod outcome;
mod sync;
pub mod var;

pub use completion::Completion;
pub use config::{ConfigError, EngineConfig, FailurePolicy};
pub use context::{Context, DeviceType, FnProperty, RunContext, StreamHandle};
pub use engine::{Engine, EngineBuilder, EngineStats, LaneStats, Scheduler};
pub use error::{EngineError, OpError, Result};
pub use lane::{HostStreams, LaneClass, LaneKey, LaneStreams, StreamProvider};
pub use operation::{OpDescriptor, OprId};
pub use outcome::{OpRecord, OpStatus, OutcomeLog, OutcomeObserver};
pub use var::{Var, VarAccess, VarId};
