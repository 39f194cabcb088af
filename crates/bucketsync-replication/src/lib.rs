//! Bucket replication engine.
//!
//! - [`ReplicationEngine`]: enumerates the source bucket and transfers every
//!   object, isolating per-object failures
//! - [`StrategySelector`]: server-side copy vs streamed transfer
//! - [`ProgressTracker`]: byte-level progress of streamed transfers
//! - [`ReplicationObserver`]: where run events go

pub mod engine;
pub mod error;
pub mod observer;
pub mod outcome;
pub mod progress;
pub mod strategy;

pub use engine::ReplicationEngine;
pub use error::{ReplicationError, ReplicationResult};
pub use observer::{
    ObserverSet, RecordingObserver, ReplicationEvent, ReplicationObserver, TracingObserver,
};
pub use outcome::{
    ErrorKind, FailedObject, ObjectState, ObjectTransferError, RunSummary, TransferOutcome,
    TransferPlan, TransferStage, TransferStatus,
};
pub use progress::ProgressTracker;
pub use strategy::{StrategySelector, TransferStrategy, SERVER_SIDE_COPY_LIMIT};

// Re-exported so callers can cancel a run without depending on tokio-util.
pub use tokio_util::sync::CancellationToken;
