//! Per-object choice between a server-side copy and a streamed transfer.

use bucketsync_core::{BucketEndpoint, TransferOptions};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest object S3 accepts in a single `CopyObject` request (5 GiB).
pub const SERVER_SIDE_COPY_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// How one object gets from source to destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategy {
    /// The provider copies the payload; no bytes pass through this process.
    ServerSideCopy,
    /// Download from the source and upload to the destination.
    Streamed,
}

impl fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStrategy::ServerSideCopy => write!(f, "server-side-copy"),
            TransferStrategy::Streamed => write!(f, "streamed"),
        }
    }
}

/// Decides the [`TransferStrategy`] of each object.
///
/// The endpoint and option checks are settled once at construction; only the
/// object size varies per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySelector {
    copy_eligible: bool,
}

impl StrategySelector {
    pub fn new(
        source: &BucketEndpoint,
        destination: &BucketEndpoint,
        options: &TransferOptions,
    ) -> Self {
        Self {
            copy_eligible: !options.force_streamed
                && !options.progress
                && source.same_account(destination),
        }
    }

    /// Whether any object of this run can be copied server-side.
    pub fn copy_eligible(&self) -> bool {
        self.copy_eligible
    }

    pub fn select(&self, size: Option<u64>) -> TransferStrategy {
        match size {
            Some(size) if self.copy_eligible && size <= SERVER_SIDE_COPY_LIMIT => {
                TransferStrategy::ServerSideCopy
            }
            _ => TransferStrategy::Streamed,
        }
    }
}
