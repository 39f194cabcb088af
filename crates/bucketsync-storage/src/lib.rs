//! Storage backends for bucket replication.
//!
//! [`object_store::ObjectStore`] is the capability interface; [`connect`]
//! picks the backend for a configured endpoint.

pub mod object_store;

pub use object_store::{
    stream_from_bytes, ByteStream, LocalObjectStore, MockS3ObjectStore, ObjectBody, ObjectStore,
    S3ObjectStore,
};

use bucketsync_core::{BucketEndpoint, CoreResult};
use std::sync::Arc;
use tracing::info;

/// URL scheme that selects the local filesystem backend.
pub const FILE_SCHEME: &str = "file://";

/// Build the object store for `endpoint`.
///
/// `file:///srv/buckets` endpoints map to a [`LocalObjectStore`] rooted at
/// `/srv/buckets`; everything else is an S3-compatible service.
pub async fn connect(endpoint: &BucketEndpoint, part_size: usize) -> CoreResult<Arc<dyn ObjectStore>> {
    if let Some(root) = endpoint
        .endpoint_url
        .as_deref()
        .and_then(|url| url.strip_prefix(FILE_SCHEME))
    {
        info!(role = %endpoint.role, root, "Using local filesystem backend");
        let store = LocalObjectStore::new(root).await?;
        return Ok(Arc::new(store));
    }

    info!(
        role = %endpoint.role,
        endpoint = endpoint.display_endpoint(),
        bucket = %endpoint.bucket,
        "Using S3 backend"
    );
    let store = S3ObjectStore::new(endpoint).await?.with_part_size(part_size);
    Ok(Arc::new(store))
}
