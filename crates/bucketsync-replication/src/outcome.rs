//! Transfer plans, per-object outcomes and the run summary.

use crate::strategy::TransferStrategy;
use bucketsync_core::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What the engine intends to do with one listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub source_key: String,
    pub destination_key: String,
    /// Size from the listing, if the server reported one
    pub size: Option<u64>,
    pub strategy: TransferStrategy,
}

impl TransferPlan {
    /// State the object is in while this plan executes.
    pub fn active_state(&self) -> ObjectState {
        match self.strategy {
            TransferStrategy::ServerSideCopy => ObjectState::Copying,
            TransferStrategy::Streamed => ObjectState::Streaming,
        }
    }
}

/// Lifecycle of one object within a run.
///
/// `Pending -> (Copying | Streaming) -> (Succeeded | Failed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Pending,
    Copying,
    Streaming,
    Succeeded,
    Failed,
}

impl ObjectState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectState::Succeeded | ObjectState::Failed)
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectState::Pending => "pending",
            ObjectState::Copying => "copying",
            ObjectState::Streaming => "streaming",
            ObjectState::Succeeded => "succeeded",
            ObjectState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Classification of a per-object failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    /// Network fault that outlived the client's retries
    Transient,
    Malformed,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Transient => "transient",
            ErrorKind::Malformed => "malformed response",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Which side of the transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Read,
    Write,
    Copy,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Read => "read",
            TransferStage::Write => "write",
            TransferStage::Copy => "copy",
        };
        f.write_str(name)
    }
}

/// Recoverable failure of a single object. Recorded, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage} failed ({kind}): {message}")]
pub struct ObjectTransferError {
    pub kind: ErrorKind,
    pub stage: TransferStage,
    pub message: String,
}

impl ObjectTransferError {
    pub fn new(kind: ErrorKind, stage: TransferStage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }

    /// Classify a client error raised during `stage`.
    pub fn from_core(stage: TransferStage, err: CoreError) -> Self {
        let kind = match &err {
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CoreError::Transport(_) => ErrorKind::Transient,
            CoreError::MalformedResponse(_) => ErrorKind::Malformed,
            CoreError::StorageError(_)
            | CoreError::ValidationError(_)
            | CoreError::IoError(_)
            | CoreError::Internal { .. } => ErrorKind::Other,
        };
        Self::new(kind, stage, err.to_string())
    }
}

/// Terminal status of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    Succeeded { bytes: u64 },
    Failed(ObjectTransferError),
}

/// Result of processing one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub source_key: String,
    pub destination_key: String,
    pub strategy: TransferStrategy,
    pub status: TransferStatus,
}

impl TransferOutcome {
    /// The per-object error boundary: whatever happened to `plan` ends up
    /// as a value here.
    pub fn from_result(plan: TransferPlan, result: Result<u64, ObjectTransferError>) -> Self {
        let status = match result {
            Ok(bytes) => TransferStatus::Succeeded { bytes },
            Err(err) => TransferStatus::Failed(err),
        };
        Self {
            source_key: plan.source_key,
            destination_key: plan.destination_key,
            strategy: plan.strategy,
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TransferStatus::Succeeded { .. })
    }

    /// Bytes moved (0 for failures).
    pub fn bytes(&self) -> u64 {
        match self.status {
            TransferStatus::Succeeded { bytes } => bytes,
            TransferStatus::Failed(_) => 0,
        }
    }

    pub fn error(&self) -> Option<&ObjectTransferError> {
        match &self.status {
            TransferStatus::Failed(err) => Some(err),
            TransferStatus::Succeeded { .. } => None,
        }
    }

    pub fn state(&self) -> ObjectState {
        if self.is_success() {
            ObjectState::Succeeded
        } else {
            ObjectState::Failed
        }
    }
}

/// A failed key with its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedObject {
    pub key: String,
    pub reason: String,
}

/// Aggregate result of a run.
///
/// `succeeded + failed == total` holds at every point; `total` counts
/// objects whose outcome has been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub failures: Vec<FailedObject>,
    pub bytes_transferred: u64,
    pub key_collisions: u64,
    pub cancelled: bool,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn start(dry_run: bool) -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
            bytes_transferred: 0,
            key_collisions: 0,
            cancelled: false,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
        }
    }

    pub fn record(&mut self, outcome: &TransferOutcome) {
        self.total += 1;
        match &outcome.status {
            TransferStatus::Succeeded { bytes } => {
                self.succeeded += 1;
                self.bytes_transferred += bytes;
            }
            TransferStatus::Failed(err) => {
                self.failed += 1;
                self.failures.push(FailedObject {
                    key: outcome.source_key.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    pub fn record_collision(&mut self) {
        self.key_collisions += 1;
    }

    /// Stamp the finish time.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.elapsed_ms = (now - self.started_at)
            .num_milliseconds()
            .try_into()
            .unwrap_or(0);
        self.finished_at = Some(now);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn is_consistent(&self) -> bool {
        self.succeeded + self.failed == self.total && self.failures.len() as u64 == self.failed
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
