use crate::outcome::RunSummary;
use bucketsync_core::{ConfigurationError, CoreError, EndpointRole};
use thiserror::Error;

/// Run-level failures. Per-object failures never end up here.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Configuration missing or invalid; nothing was contacted.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// An object store client could not be built.
    #[error("failed to create {role} client: {source}")]
    Client {
        role: EndpointRole,
        #[source]
        source: CoreError,
    },

    /// Listing the source bucket failed; `partial` covers the objects
    /// processed before the failing page request.
    #[error("failed to list source bucket `{bucket}`: {source}")]
    Enumeration {
        bucket: String,
        #[source]
        source: CoreError,
        partial: Box<RunSummary>,
    },
}

impl ReplicationError {
    /// Summary of the work done before the failure, if any was attempted.
    pub fn partial_summary(&self) -> Option<&RunSummary> {
        match self {
            ReplicationError::Enumeration { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Convenient result alias for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_error_carries_partial_summary() {
        let mut partial = RunSummary::start(false);
        partial.total = 3;
        partial.succeeded = 3;

        let err = ReplicationError::Enumeration {
            bucket: "src".to_string(),
            source: CoreError::not_found("bucket", "src"),
            partial: Box::new(partial),
        };

        assert_eq!(
            err.to_string(),
            "failed to list source bucket `src`: bucket `src` was not found"
        );
        assert_eq!(err.partial_summary().map(|s| s.total), Some(3));
    }

    #[test]
    fn test_configuration_error_is_transparent() {
        let err: ReplicationError =
            ConfigurationError::Missing(vec!["SOURCE_BUCKET".to_string()]).into();
        assert_eq!(err.to_string(), "missing required configuration keys: SOURCE_BUCKET");
        assert!(err.partial_summary().is_none());
    }
}
