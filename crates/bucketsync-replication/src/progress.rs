//! Byte-level progress of a single streamed transfer.

use crate::observer::{ReplicationEvent, ReplicationObserver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cumulative byte counter for one object.
///
/// Reported positions never exceed the declared size; the real total is
/// only published by [`ProgressTracker::finish`], so a listing that
/// under-reports a size never makes the bar overshoot mid-transfer.
pub struct ProgressTracker {
    key: String,
    declared: Option<u64>,
    transferred: AtomicU64,
    observer: Arc<dyn ReplicationObserver>,
}

impl ProgressTracker {
    pub fn new(
        key: impl Into<String>,
        declared: Option<u64>,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Self {
        Self {
            key: key.into(),
            declared,
            transferred: AtomicU64::new(0),
            observer,
        }
    }

    /// Record `n` more bytes and forward the new position.
    pub fn on_bytes(&self, n: u64) {
        let previous = self
            .transferred
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            })
            .unwrap_or_else(|current| current);
        let transferred = previous.saturating_add(n);

        self.observer.on_event(&ReplicationEvent::Progress {
            key: self.key.clone(),
            transferred: self.clamp(transferred),
            total: self.declared,
        });
    }

    /// Raw byte count so far.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Reportable position: the byte count capped at the declared size.
    pub fn position(&self) -> u64 {
        self.clamp(self.transferred())
    }

    pub fn total(&self) -> Option<u64> {
        self.declared
    }

    /// Close the tracker and publish the actual total as final.
    pub fn finish(&self) -> u64 {
        let actual = self.transferred();
        if let Some(declared) = self.declared {
            if declared != actual {
                debug!(
                    key = %self.key,
                    declared,
                    actual,
                    "Transferred size differs from the declared size"
                );
            }
        }

        self.observer.on_event(&ReplicationEvent::Progress {
            key: self.key.clone(),
            transferred: actual,
            total: Some(actual),
        });
        actual
    }

    fn clamp(&self, value: u64) -> u64 {
        match self.declared {
            Some(declared) => value.min(declared),
            None => value,
        }
    }
}
