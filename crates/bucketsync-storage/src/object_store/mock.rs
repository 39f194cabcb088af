//! Mock S3 ObjectStore for testing
//!
//! Provides in-memory buckets with configurable failure patterns for testing
//! pagination, per-object error isolation and streaming without real
//! AWS/MinIO dependencies.
//!
//! # Features
//!
//! - **Deterministic Failures**: Pre-defined failure sequences consumed per call
//! - **Per-key Failures**: A given operation on a given key always fails
//! - **Listing Failures**: Make enumeration itself fail
//! - **Small Pages**: Force multi-page listings
//! - **Chunked Reads**: Split payloads to exercise progress reporting
//! - **Call History**: Track all operations for assertions
//!
//! # Examples
//!
//! ```rust
//! use bucketsync_storage::object_store::{
//!     stream_from_bytes, MockFailure, MockOperation, MockS3ObjectStore, ObjectStore,
//! };
//! use bytes::Bytes;
//!
//! # async fn example() -> bucketsync_core::CoreResult<()> {
//! let mock = MockS3ObjectStore::new();
//! mock.insert("src", "ok.txt", Bytes::from("fine"));
//! mock.insert("src", "secret.txt", Bytes::from("nope"));
//! mock.fail_key(MockOperation::Get, "secret.txt", MockFailure::Denied);
//!
//! assert!(mock.get("src", "ok.txt").await.is_ok());
//! assert!(mock.get("src", "secret.txt").await.is_err());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{ByteStream, ObjectBody, ObjectStore};
use bucketsync_core::{CoreError, CoreResult, ObjectDescriptor, ObjectPage};

/// Mock S3 failure pattern.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Transient error that outlived retries. Examples: 500, 503, timeout.
    Transient(&'static str),

    /// Permanent backend error. Examples: 400, 409.
    Permanent(&'static str),

    /// 403 AccessDenied.
    Denied,

    /// 404 NoSuchKey / NoSuchBucket.
    Missing,

    /// Response body could not be parsed.
    Malformed,

    /// Success (no error).
    Ok,
}

impl MockFailure {
    /// Convert failure to CoreError.
    fn to_error(&self, bucket: &str, key: &str) -> Option<CoreError> {
        match self {
            MockFailure::Transient(msg) => Some(CoreError::Transport(format!("Transient: {}", msg))),
            MockFailure::Permanent(msg) => {
                Some(CoreError::StorageError(format!("Permanent: {}", msg)))
            }
            MockFailure::Denied => Some(CoreError::PermissionDenied(format!(
                "403 AccessDenied on {}/{}",
                bucket, key
            ))),
            MockFailure::Missing => Some(CoreError::not_found("object", key)),
            MockFailure::Malformed => Some(CoreError::MalformedResponse(
                "unexpected end of XML document".to_string(),
            )),
            MockFailure::Ok => None,
        }
    }
}

/// Operation kinds, for per-key failures and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    List,
    Get,
    Put,
    Copy,
}

impl fmt::Display for MockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MockOperation::List => "list",
            MockOperation::Get => "get",
            MockOperation::Put => "put",
            MockOperation::Copy => "copy",
        };
        f.write_str(name)
    }
}

/// Mock S3 configuration.
#[derive(Debug, Clone)]
pub struct MockS3Config {
    /// Simulated network latency per call.
    pub latency: Duration,

    /// Maximum objects per listing page (S3 uses 1000).
    pub page_size: usize,

    /// Chunk size of `get` streams.
    pub chunk_size: usize,

    /// Enable call history tracking.
    pub track_history: bool,
}

impl Default for MockS3Config {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            page_size: 1000,
            chunk_size: 64 * 1024,
            track_history: true,
        }
    }
}

/// Mock S3 call history entry.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    pub operation: MockOperation,

    /// Bucket the call addressed (destination bucket for copies).
    pub bucket: String,

    /// Object key (destination key for copies, continuation for listings).
    pub key: String,

    /// Whether operation succeeded.
    pub success: bool,

    /// Timestamp of operation.
    pub timestamp: Instant,
}

type Buckets = HashMap<String, BTreeMap<String, Bytes>>;

/// Mock S3 ObjectStore implementation for testing.
///
/// Buckets are created implicitly on first write, or explicitly with
/// [`MockS3ObjectStore::create_bucket`]. Listings come back in
/// lexical key order, like S3's.
pub struct MockS3ObjectStore {
    /// In-memory buckets.
    storage: Arc<RwLock<Buckets>>,

    /// Failure pattern queue (deterministic failures, any operation).
    failure_queue: Arc<RwLock<VecDeque<MockFailure>>>,

    /// Failures that always hit one operation on one key.
    key_failures: Arc<RwLock<HashMap<(MockOperation, String), MockFailure>>>,

    /// Listing sizes that disagree with the stored payload.
    advertised_sizes: Arc<RwLock<HashMap<String, Option<u64>>>>,

    /// Configuration.
    config: MockS3Config,

    /// Call history (for assertions).
    call_history: Arc<RwLock<Vec<CallHistoryEntry>>>,
}

impl MockS3ObjectStore {
    /// Create new mock S3 with default config (no failures).
    pub fn new() -> Self {
        Self::new_with_config(MockS3Config::default())
    }

    /// Create new mock S3 with custom config.
    pub fn new_with_config(config: MockS3Config) -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            failure_queue: Arc::new(RwLock::new(VecDeque::new())),
            key_failures: Arc::new(RwLock::new(HashMap::new())),
            advertised_sizes: Arc::new(RwLock::new(HashMap::new())),
            config,
            call_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create mock S3 whose listings return at most `page_size` objects.
    pub fn with_page_size(page_size: usize) -> Self {
        Self::new_with_config(MockS3Config {
            page_size: page_size.max(1),
            ..MockS3Config::default()
        })
    }

    /// Create mock S3 with deterministic failure pattern.
    ///
    /// Failures are consumed in order, one per call of any kind. Once the
    /// queue is empty, all operations succeed.
    pub fn new_with_failures(pattern: Vec<MockFailure>) -> Self {
        let mut mock = Self::new();
        mock.failure_queue = Arc::new(RwLock::new(pattern.into()));
        mock
    }

    /// Make `operation` on `key` fail on every call.
    ///
    /// For copies the key is the source key; for listings use the bucket name.
    pub fn fail_key(&self, operation: MockOperation, key: impl Into<String>, failure: MockFailure) {
        self.key_failures
            .write()
            .insert((operation, key.into()), failure);
    }

    /// Make every listing of `bucket` fail.
    pub fn fail_listing(&self, bucket: impl Into<String>, failure: MockFailure) {
        self.fail_key(MockOperation::List, bucket, failure);
    }

    /// Report `size` for `key` in listings instead of its real length.
    pub fn advertise_size(&self, key: impl Into<String>, size: Option<u64>) {
        self.advertised_sizes.write().insert(key.into(), size);
    }

    /// Create an empty bucket; existing contents are kept.
    pub fn create_bucket(&self, bucket: &str) {
        self.storage.write().entry(bucket.to_string()).or_default();
    }

    /// Seed an object directly, bypassing failures and history.
    pub fn insert(&self, bucket: &str, key: &str, data: Bytes) {
        self.storage
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data);
    }

    /// Read an object directly, bypassing failures and history.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.storage
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    /// Snapshot of a bucket's contents.
    pub fn bucket_snapshot(&self, bucket: &str) -> BTreeMap<String, Bytes> {
        self.storage.read().get(bucket).cloned().unwrap_or_default()
    }

    /// Get current number of objects in a bucket.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.storage.read().get(bucket).map_or(0, BTreeMap::len)
    }

    /// Get call history for assertions.
    pub fn get_call_history(&self) -> Vec<CallHistoryEntry> {
        self.call_history.read().clone()
    }

    /// Number of calls of a given kind.
    pub fn calls(&self, operation: MockOperation) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|entry| entry.operation == operation)
            .count()
    }

    /// Number of successful writes (puts and copies).
    pub fn successful_writes(&self) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|entry| {
                matches!(entry.operation, MockOperation::Put | MockOperation::Copy)
                    && entry.success
            })
            .count()
    }

    /// Simulate failure: per-key rule first, then the shared queue.
    fn check_failure(
        &self,
        operation: MockOperation,
        bucket: &str,
        key: &str,
    ) -> Option<CoreError> {
        if let Some(failure) = self.key_failures.read().get(&(operation, key.to_string())) {
            return failure.to_error(bucket, key);
        }
        let mut queue = self.failure_queue.write();
        queue
            .pop_front()
            .and_then(|failure| failure.to_error(bucket, key))
    }

    /// Record call in history.
    fn record_call(&self, operation: MockOperation, bucket: &str, key: &str, success: bool) {
        if self.config.track_history {
            self.call_history.write().push(CallHistoryEntry {
                operation,
                bucket: bucket.to_string(),
                key: key.to_string(),
                success,
                timestamp: Instant::now(),
            });
        }
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

impl Default for MockS3ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MockS3ObjectStore {
    fn backend(&self) -> &'static str {
        "mock"
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> CoreResult<ObjectPage> {
        self.simulate_latency().await;

        let token = continuation.clone().unwrap_or_default();
        if let Some(error) = self.check_failure(MockOperation::List, bucket, bucket) {
            self.record_call(MockOperation::List, bucket, &token, false);
            return Err(error);
        }

        let storage = self.storage.read();
        let Some(objects) = storage.get(bucket) else {
            drop(storage);
            self.record_call(MockOperation::List, bucket, &token, false);
            return Err(CoreError::not_found("bucket", bucket));
        };

        // Continuation tokens are the last key of the previous page.
        let sizes = self.advertised_sizes.read();
        let mut page: Vec<ObjectDescriptor> = objects
            .iter()
            .filter(|(k, _)| continuation.as_deref().map_or(true, |after| k.as_str() > after))
            .filter(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
            .take(self.config.page_size + 1)
            .map(|(k, v)| {
                let size = sizes.get(k).copied().unwrap_or(Some(v.len() as u64));
                ObjectDescriptor::new(k.clone(), size)
            })
            .collect();

        let next_continuation = if page.len() > self.config.page_size {
            page.truncate(self.config.page_size);
            page.last().map(|o| o.key.clone())
        } else {
            None
        };
        drop(sizes);
        drop(storage);

        self.record_call(MockOperation::List, bucket, &token, true);
        Ok(ObjectPage {
            objects: page,
            next_continuation,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> CoreResult<ObjectBody> {
        self.simulate_latency().await;

        if let Some(error) = self.check_failure(MockOperation::Get, bucket, key) {
            self.record_call(MockOperation::Get, bucket, key, false);
            return Err(error);
        }

        let Some(data) = self.object(bucket, key) else {
            self.record_call(MockOperation::Get, bucket, key, false);
            return Err(CoreError::not_found("object", key));
        };
        self.record_call(MockOperation::Get, bucket, key, true);

        let content_length = Some(data.len() as u64);
        let chunk_size = self.config.chunk_size.max(1);
        let chunks: Vec<CoreResult<Bytes>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();

        Ok(ObjectBody {
            stream: futures::stream::iter(chunks).boxed(),
            content_length,
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        _size_hint: Option<u64>,
    ) -> CoreResult<u64> {
        self.simulate_latency().await;

        if let Some(error) = self.check_failure(MockOperation::Put, bucket, key) {
            self.record_call(MockOperation::Put, bucket, key, false);
            return Err(error);
        }

        // Nothing becomes visible unless the whole stream arrives.
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    self.record_call(MockOperation::Put, bucket, key, false);
                    return Err(e);
                }
            }
        }

        let written = buffer.len() as u64;
        self.insert(bucket, key, buffer.freeze());
        self.record_call(MockOperation::Put, bucket, key, true);
        Ok(written)
    }

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
    ) -> CoreResult<()> {
        self.simulate_latency().await;

        if let Some(error) = self.check_failure(MockOperation::Copy, source_bucket, source_key) {
            self.record_call(MockOperation::Copy, destination_bucket, destination_key, false);
            return Err(error);
        }

        match self.object(source_bucket, source_key) {
            Some(data) => {
                self.insert(destination_bucket, destination_key, data);
                self.record_call(MockOperation::Copy, destination_bucket, destination_key, true);
                Ok(())
            }
            None => {
                self.record_call(MockOperation::Copy, destination_bucket, destination_key, false);
                Err(CoreError::not_found("object", source_key))
            }
        }
    }
}
