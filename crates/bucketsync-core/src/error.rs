use thiserror::Error;

/// Canonical error type for object store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Object or bucket was not found in the store.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"object"`, `"bucket"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Credentials were rejected or lack the required permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Network or timeout failure that outlived the client's retry policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// Server answered with something the client could not interpret.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// I/O error occurred during file or network operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
