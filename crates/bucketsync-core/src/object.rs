use serde::{Deserialize, Serialize};

/// One object as reported by a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Object key (unique within the bucket)
    pub key: String,
    /// Size in bytes, when the listing reports it
    pub size: Option<u64>,
}

impl ObjectDescriptor {
    pub fn new(key: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}

/// A single page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    /// Objects in listing order
    pub objects: Vec<ObjectDescriptor>,
    /// Opaque token for the next page; `None` on the last page
    pub next_continuation: Option<String>,
}

impl ObjectPage {
    /// Whether another page follows this one.
    pub fn has_more(&self) -> bool {
        self.next_continuation.is_some()
    }
}
