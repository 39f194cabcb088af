//! Run events and the sinks that consume them.
//!
//! The engine reports everything it does as a [`ReplicationEvent`]; how the
//! events are rendered (log lines, progress bars, test recorders) is up to
//! the [`ReplicationObserver`] implementation.

use crate::outcome::{ObjectTransferError, RunSummary, TransferPlan};
use crate::strategy::TransferStrategy;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    RunStarted {
        source_bucket: String,
        destination_bucket: String,
        destination_prefix: String,
        dry_run: bool,
    },
    PageListed {
        page: u64,
        objects: usize,
        has_more: bool,
    },
    ObjectStarted {
        plan: TransferPlan,
    },
    /// Cumulative byte count of a streamed transfer
    Progress {
        key: String,
        transferred: u64,
        total: Option<u64>,
    },
    ObjectSucceeded {
        source_key: String,
        destination_key: String,
        strategy: TransferStrategy,
        bytes: u64,
    },
    ObjectFailed {
        source_key: String,
        destination_key: String,
        strategy: TransferStrategy,
        error: ObjectTransferError,
    },
    /// Two source keys map to the same destination key; the later one wins.
    KeyCollision {
        destination_key: String,
        first_source_key: String,
        second_source_key: String,
    },
    RunFinished {
        summary: RunSummary,
    },
}

/// Receives run events. Called from worker tasks, so it must be cheap and
/// must not block.
pub trait ReplicationObserver: Send + Sync {
    fn on_event(&self, event: &ReplicationEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ReplicationObserver for TracingObserver {
    fn on_event(&self, event: &ReplicationEvent) {
        match event {
            ReplicationEvent::RunStarted {
                source_bucket,
                destination_bucket,
                destination_prefix,
                dry_run,
            } => info!(
                source = %source_bucket,
                destination = %destination_bucket,
                prefix = %destination_prefix,
                dry_run,
                "Starting replication"
            ),
            ReplicationEvent::PageListed {
                page,
                objects,
                has_more,
            } => debug!(page, objects, has_more, "Listed source page"),
            ReplicationEvent::ObjectStarted { plan } => {
                let size = plan
                    .size
                    .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                info!(
                    strategy = %plan.strategy,
                    "Copying {} to {} ({} bytes)",
                    plan.source_key,
                    plan.destination_key,
                    size
                );
            }
            ReplicationEvent::Progress {
                key,
                transferred,
                total,
            } => trace!(key = %key, transferred, total = ?total, "Transfer progress"),
            ReplicationEvent::ObjectSucceeded {
                source_key,
                destination_key,
                strategy,
                bytes,
            } => debug!(
                source = %source_key,
                destination = %destination_key,
                strategy = %strategy,
                bytes,
                "Object replicated"
            ),
            ReplicationEvent::ObjectFailed {
                source_key,
                destination_key,
                strategy,
                error,
            } => error!(
                source = %source_key,
                destination = %destination_key,
                strategy = %strategy,
                kind = %error.kind,
                "Error copying {}: {}",
                source_key,
                error
            ),
            ReplicationEvent::KeyCollision {
                destination_key,
                first_source_key,
                second_source_key,
            } => warn!(
                destination = %destination_key,
                first = %first_source_key,
                second = %second_source_key,
                "Destination key collision; the later object overwrites the earlier one"
            ),
            ReplicationEvent::RunFinished { summary } => info!(
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                bytes = summary.bytes_transferred,
                collisions = summary.key_collisions,
                cancelled = summary.cancelled,
                elapsed_ms = summary.elapsed_ms,
                "Replication finished"
            ),
        }
    }
}

/// Fans events out to several observers, in order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ReplicationObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ReplicationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ReplicationObserver for ObserverSet {
    fn on_event(&self, event: &ReplicationEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Keeps every event in memory. Handy for tests and embedding.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ReplicationEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReplicationEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&ReplicationEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl ReplicationObserver for RecordingObserver {
    fn on_event(&self, event: &ReplicationEvent) {
        self.events.lock().push(event.clone());
    }
}
