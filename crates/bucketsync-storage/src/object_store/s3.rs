//! AWS S3 implementation of ObjectStore
//!
//! Supports standard AWS S3 and S3-compatible endpoints (MinIO, Wasabi, etc.).
//! Streamed writes of more than one part go through a multipart upload that
//! is aborted on failure, so an interrupted transfer never leaves a truncated
//! object behind.

use super::tls::insecure_http_client;
use super::{ByteStream, ObjectBody, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bucketsync_core::config::{BucketEndpoint, DEFAULT_PART_SIZE, MIN_PART_SIZE};
use bucketsync_core::{CoreError, CoreResult, ObjectDescriptor, ObjectPage};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, warn};

/// Characters left unencoded in a `CopySource` header; `/` separates key
/// segments and must survive.
const COPY_SOURCE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Most parts S3 accepts in a single multipart upload.
const MAX_PARTS: i32 = 10_000;

/// Part size for an upload of `size_hint` bytes: never below `part_size`,
/// and large enough that the whole object fits in [`MAX_PARTS`] parts.
fn part_size_for(part_size: usize, size_hint: Option<u64>) -> usize {
    match size_hint {
        Some(size) => {
            let needed = size.div_ceil(MAX_PARTS as u64);
            part_size.max(usize::try_from(needed).unwrap_or(usize::MAX))
        }
        None => part_size,
    }
}

/// Refuse part numbers S3 would reject, before the part is sent.
fn check_part_number(part_number: i32, bucket: &str, key: &str) -> CoreResult<()> {
    if part_number > MAX_PARTS {
        return Err(CoreError::ValidationError(format!(
            "S3 multipart upload {}/{} exceeds {} parts; object is larger than its declared size",
            bucket, key, MAX_PARTS
        )));
    }
    Ok(())
}

/// AWS S3 object store
///
/// # Example
///
/// ```rust,no_run
/// use bucketsync_core::{BucketEndpoint, Credentials, EndpointRole};
/// use bucketsync_storage::object_store::{ObjectStore, S3ObjectStore};
///
/// #[tokio::main]
/// async fn main() -> bucketsync_core::CoreResult<()> {
///     let endpoint = BucketEndpoint::new(
///         EndpointRole::Source,
///         "test-bucket",
///         "us-east-1",
///         Credentials::new("minioadmin", "minioadmin"),
///     )
///     .with_endpoint_url("http://localhost:9000");
///
///     let store = S3ObjectStore::new(&endpoint).await?;
///     let page = store.list_page("test-bucket", None, None).await?;
///     println!("{} objects on the first page", page.objects.len());
///     Ok(())
/// }
/// ```
pub struct S3ObjectStore {
    client: Client,
    part_size: usize,
}

impl S3ObjectStore {
    /// Create a new S3 object store for `endpoint`
    ///
    /// Honors the endpoint's retry policy (SDK "standard" retry mode) and its
    /// TLS-verification flag.
    pub async fn new(endpoint: &BucketEndpoint) -> CoreResult<Self> {
        let credentials = Credentials::new(
            &endpoint.credentials.access_key_id,
            &endpoint.credentials.secret_access_key,
            None,
            None,
            "bucketsync-static",
        );

        let retry = RetryConfig::standard()
            .with_max_attempts(endpoint.retry.max_attempts)
            .with_initial_backoff(endpoint.retry.initial_backoff())
            .with_max_backoff(endpoint.retry.max_backoff());

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(endpoint.region.clone()))
            .credentials_provider(credentials)
            .retry_config(retry);

        if let Some(url) = &endpoint.endpoint_url {
            loader = loader.endpoint_url(url);
        }

        if !endpoint.verify_tls {
            warn!(
                role = %endpoint.role,
                endpoint = endpoint.display_endpoint(),
                "Creating S3 client with TLS certificate verification disabled"
            );
            loader = loader.http_client(insecure_http_client());
        }

        let sdk_config = loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if endpoint.endpoint_url.is_some() {
            // Required for MinIO
            s3_config = s3_config.force_path_style(true);
        }

        debug!(
            role = %endpoint.role,
            endpoint = endpoint.display_endpoint(),
            region = %endpoint.region,
            max_attempts = endpoint.retry.max_attempts,
            "Created S3 client"
        );

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            part_size: DEFAULT_PART_SIZE,
        })
    }

    /// Set the multipart part size (clamped to the S3 minimum).
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    async fn put_single(&self, bucket: &str, key: &str, data: Bytes) -> CoreResult<u64> {
        let len = data.len() as u64;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(len as i64)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "put", bucket, key))?;
        Ok(len)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> CoreResult<CompletedPart> {
        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "upload_part", bucket, key))?;

        Ok(CompletedPart::builder()
            .set_e_tag(resp.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    /// Upload `first` plus the remainder of `body` as parts of `upload_id`.
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_size: usize,
        mut buffer: BytesMut,
        body: &mut ByteStream,
    ) -> CoreResult<u64> {
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut written = 0u64;
        let mut exhausted = false;

        loop {
            while buffer.len() < part_size && !exhausted {
                match body.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => exhausted = true,
                }
            }

            if buffer.len() >= part_size {
                check_part_number(part_number, bucket, key)?;
                let data = buffer.split_to(part_size).freeze();
                written += data.len() as u64;
                parts.push(self.upload_part(bucket, key, upload_id, part_number, data).await?);
                part_number += 1;
                continue;
            }

            if !buffer.is_empty() {
                check_part_number(part_number, bucket, key)?;
                let data = std::mem::take(&mut buffer).freeze();
                written += data.len() as u64;
                parts.push(self.upload_part(bucket, key, upload_id, part_number, data).await?);
            }
            break;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "complete_multipart_upload", bucket, key))?;

        Ok(written)
    }
}

/// Map an SDK failure onto the shared error taxonomy.
fn classify_sdk_error<E, R>(err: SdkError<E, R>, op: &str, bucket: &str, key: &str) -> CoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug + 'static,
{
    let detail = format!(
        "S3 {} {}/{} failed: {}",
        op,
        bucket,
        key,
        DisplayErrorContext(&err)
    );

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => CoreError::Transport(detail),
        SdkError::ResponseError(_) => CoreError::MalformedResponse(detail),
        _ => match err.code() {
            Some("NoSuchKey") | Some("NotFound") => {
                CoreError::not_found("object", format!("{}/{}", bucket, key))
            }
            Some("NoSuchBucket") => CoreError::not_found("bucket", bucket),
            Some("AccessDenied")
            | Some("InvalidAccessKeyId")
            | Some("SignatureDoesNotMatch")
            | Some("AllAccessDisabled")
            | Some("AccountProblem") => CoreError::PermissionDenied(detail),
            Some("SlowDown")
            | Some("InternalError")
            | Some("ServiceUnavailable")
            | Some("RequestTimeout") => CoreError::Transport(detail),
            _ => CoreError::StorageError(detail),
        },
    }
}

fn copy_source(bucket: &str, key: &str) -> String {
    format!(
        "{}/{}",
        bucket,
        utf8_percent_encode(key, COPY_SOURCE_ENCODE_SET)
    )
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> CoreResult<ObjectPage> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(str::to_string))
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "list_objects_v2", bucket, prefix.unwrap_or("")))?;

        let objects = resp
            .contents()
            .iter()
            .filter_map(|obj| {
                let Some(key) = obj.key() else {
                    warn!(bucket, "Listing returned an object without a key; skipping");
                    return None;
                };
                let size = obj.size().and_then(|s| u64::try_from(s).ok());
                Some(ObjectDescriptor::new(key, size))
            })
            .collect();

        let next_continuation = match (resp.is_truncated(), resp.next_continuation_token()) {
            (Some(true), Some(token)) => Some(token.to_string()),
            (Some(true), None) => {
                return Err(CoreError::MalformedResponse(format!(
                    "S3 list_objects_v2 {}: truncated page without a continuation token",
                    bucket
                )));
            }
            _ => None,
        };

        Ok(ObjectPage {
            objects,
            next_continuation,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> CoreResult<ObjectBody> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "get", bucket, key))?;

        let content_length = resp.content_length().and_then(|l| u64::try_from(l).ok());
        let location = format!("{}/{}", bucket, key);

        let stream = futures::stream::try_unfold(resp.body, move |mut body| {
            let location = location.clone();
            async move {
                match body.try_next().await {
                    Ok(Some(chunk)) => Ok(Some((chunk, body))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(CoreError::Transport(format!(
                        "S3 read {} failed: {}",
                        location, e
                    ))),
                }
            }
        });

        Ok(ObjectBody {
            stream: stream.boxed(),
            content_length,
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        size_hint: Option<u64>,
    ) -> CoreResult<u64> {
        // Buffer up to one part; whatever fits goes up in a single request.
        let part_size = part_size_for(self.part_size, size_hint);
        let capacity = size_hint
            .map(|s| usize::try_from(s).unwrap_or(usize::MAX).min(part_size))
            .unwrap_or(part_size);
        let mut buffer = BytesMut::with_capacity(capacity);
        let mut exhausted = false;
        while buffer.len() < part_size {
            match body.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if exhausted {
            return self.put_single(bucket, key, buffer.freeze()).await;
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "create_multipart_upload", bucket, key))?;
        let upload_id = created.upload_id().map(str::to_string).ok_or_else(|| {
            CoreError::MalformedResponse(format!(
                "S3 create_multipart_upload {}/{}: missing upload id",
                bucket, key
            ))
        })?;

        match self
            .upload_parts(bucket, key, &upload_id, part_size, buffer, &mut body)
            .await
        {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        bucket,
                        key,
                        upload_id = %upload_id,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
    ) -> CoreResult<()> {
        self.client
            .copy_object()
            .copy_source(copy_source(source_bucket, source_key))
            .bucket(destination_bucket)
            .key(destination_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "copy", source_bucket, source_key))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_core::{Credentials, EndpointRole};

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(copy_source("bucket", "a/b.txt"), "bucket/a/b.txt");
        assert_eq!(
            copy_source("bucket", "dir/with space+plus.txt"),
            "bucket/dir/with%20space%2Bplus.txt"
        );
        assert_eq!(copy_source("bucket", "naïve"), "bucket/na%C3%AFve");
    }

    #[test]
    fn test_part_size_grows_with_object() {
        const MIB: u64 = 1024 * 1024;
        let part_size = DEFAULT_PART_SIZE;

        assert_eq!(part_size_for(part_size, None), part_size);
        assert_eq!(part_size_for(part_size, Some(MIB)), part_size);

        let huge = 100 * 1024 * MIB;
        let grown = part_size_for(part_size, Some(huge));
        assert!(grown > part_size);
        assert!(grown as u64 * MAX_PARTS as u64 >= huge);
        assert!((grown as u64 - 1) * (MAX_PARTS as u64) < huge);
    }

    #[test]
    fn test_part_number_limit() {
        assert!(check_part_number(1, "bucket", "key").is_ok());
        assert!(check_part_number(MAX_PARTS, "bucket", "key").is_ok());
        assert!(matches!(
            check_part_number(MAX_PARTS + 1, "bucket", "key"),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_s3_store_construction() {
        let endpoint = BucketEndpoint::new(
            EndpointRole::Destination,
            "bucket",
            "us-east-1",
            Credentials::new("access", "secret"),
        )
        .with_endpoint_url("http://localhost:9000");

        let store = S3ObjectStore::new(&endpoint).await.unwrap();
        assert_eq!(store.backend(), "s3");
        assert_eq!(store.part_size, DEFAULT_PART_SIZE);
    }

    #[tokio::test]
    async fn test_s3_store_insecure_construction() {
        let endpoint = BucketEndpoint::new(
            EndpointRole::Source,
            "bucket",
            "us-east-1",
            Credentials::new("access", "secret"),
        )
        .with_endpoint_url("https://minio.local:9000")
        .with_verify_tls(false);

        let store = S3ObjectStore::new(&endpoint).await.unwrap().with_part_size(1);
        assert_eq!(store.part_size, MIN_PART_SIZE);
    }
}
