//! Object Store abstraction for S3-compatible storage
//!
//! Provides the capability interface the replication engine drives, with
//! multiple backends:
//! - AWS S3 and S3-compatible endpoints (production)
//! - Local filesystem (offline use)
//! - In-memory mock with failure injection (testing)

mod local;
mod mock;
mod s3;
mod tls;

pub use local::LocalObjectStore;
pub use mock::{CallHistoryEntry, MockFailure, MockOperation, MockS3Config, MockS3ObjectStore};
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use bucketsync_core::{CoreResult, ObjectPage};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

/// Lazily produced object payload. Chunks flow from the read side to the
/// write side one at a time.
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

/// Payload of a `get` together with the size the server advertised for it.
pub struct ObjectBody {
    pub stream: ByteStream,
    /// Advertised length; may be absent or disagree with the listing
    pub content_length: Option<u64>,
}

impl ObjectBody {
    /// Buffer the whole payload. Test and small-object helper.
    pub async fn collect(self) -> CoreResult<Bytes> {
        let chunks: Vec<Bytes> = self.stream.try_collect().await?;
        let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Wrap an in-memory payload as a [`ByteStream`].
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    futures::stream::once(async move { Ok(data) }).boxed()
}

/// Object Store trait - bucket-addressed S3-like capabilities
///
/// All implementations must be thread-safe (Send + Sync) and support
/// concurrent operations. Keys are UTF-8 strings treated as opaque identifiers.
///
/// # Error Handling
///
/// - `CoreError::NotFound` - object or bucket does not exist
/// - `CoreError::PermissionDenied` - credentials rejected
/// - `CoreError::Transport` - network fault that outlived the retry policy
/// - `CoreError::MalformedResponse` - unparseable server answer
/// - `CoreError::StorageError` - any other backend failure
///
/// # Examples
///
/// ```rust
/// use bucketsync_storage::object_store::{stream_from_bytes, MockS3ObjectStore, ObjectStore};
/// use bytes::Bytes;
///
/// # async fn example() -> bucketsync_core::CoreResult<()> {
/// let store = MockS3ObjectStore::new();
/// store
///     .put("bucket", "hello.txt", stream_from_bytes(Bytes::from("hi")), Some(2))
///     .await?;
///
/// let page = store.list_page("bucket", None, None).await?;
/// assert_eq!(page.objects.len(), 1);
/// assert!(!page.has_more());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in log lines ("s3", "local", "mock").
    fn backend(&self) -> &'static str;

    /// List one page of objects.
    ///
    /// Pass `None` as `continuation` for the first page, then the previous
    /// page's `next_continuation` until it comes back `None`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> CoreResult<ObjectPage>;

    /// Open an object for streaming reads.
    async fn get(&self, bucket: &str, key: &str) -> CoreResult<ObjectBody>;

    /// Write an object from a byte stream (overwrites if it exists).
    ///
    /// Returns the number of bytes written. A failed write must not leave a
    /// partial object visible under `key`.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size_hint: Option<u64>,
    ) -> CoreResult<u64>;

    /// Server-side copy; the payload never passes through this process.
    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
    ) -> CoreResult<()>;
}
