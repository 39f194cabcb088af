//! Local filesystem implementation of ObjectStore
//!
//! Each bucket is a directory under a root directory; objects are files with
//! the key as the relative path. Used for `file://` endpoints.

use super::{ByteStream, ObjectBody, ObjectStore};
use async_trait::async_trait;
use bucketsync_core::{CoreError, CoreResult, ObjectDescriptor, ObjectPage};
use futures::{StreamExt, TryStreamExt};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

const PARTIAL_SUFFIX: &str = ".bucketsync-partial";
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Local filesystem object store
///
/// Writes go to a hidden partial file that is renamed into place once the
/// stream completes, so readers never observe a truncated object.
///
/// # Example
///
/// ```rust,no_run
/// use bucketsync_storage::object_store::{LocalObjectStore, ObjectStore};
///
/// #[tokio::main]
/// async fn main() -> bucketsync_core::CoreResult<()> {
///     let store = LocalObjectStore::new("./buckets").await?;
///     let page = store.list_page("photos", None, None).await?;
///     println!("Found {} objects", page.objects.len());
///     Ok(())
/// }
/// ```
pub struct LocalObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalObjectStore {
    /// Create a new local object store
    ///
    /// Creates the root directory if it doesn't exist.
    pub async fn new(root: impl AsRef<Path>) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn bucket_path(&self, bucket: &str) -> CoreResult<PathBuf> {
        validate_segment(bucket, "bucket")?;
        Ok(self.root.join(bucket))
    }

    /// Convert bucket + key to a filesystem path, rejecting keys that would
    /// escape the bucket or cannot be files.
    fn object_path(&self, bucket: &str, key: &str) -> CoreResult<PathBuf> {
        if key.is_empty() || key.ends_with('/') {
            return Err(CoreError::ValidationError(format!(
                "key `{}` cannot be stored as a file",
                key
            )));
        }
        let mut path = self.bucket_path(bucket)?;
        for segment in key.split('/') {
            validate_segment(segment, "key")?;
            path.push(segment);
        }
        Ok(path)
    }

    /// Recursively list all files under a directory
    fn list_recursive<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<Vec<(PathBuf, u64)>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut results = Vec::new();

            let mut read_dir = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;

                if metadata.is_file() {
                    results.push((path, metadata.len()));
                } else if metadata.is_dir() {
                    let mut sub_results = self.list_recursive(&path).await?;
                    results.append(&mut sub_results);
                }
            }

            Ok(results)
        })
    }
}

fn validate_segment(segment: &str, what: &str) -> CoreResult<()> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !segment.contains('\\') => Ok(()),
        _ => Err(CoreError::ValidationError(format!(
            "invalid {} segment `{}`",
            what, segment
        ))),
    }
}

/// Relative path back to a `/`-separated key.
fn path_to_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn not_found_or_io(err: std::io::Error, entity: &'static str, id: &str) -> CoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CoreError::not_found(entity, id)
    } else if err.kind() == std::io::ErrorKind::PermissionDenied {
        CoreError::PermissionDenied(format!("{}: {}", id, err))
    } else {
        CoreError::from(err)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    let mut partial = path.to_path_buf();
    partial.set_file_name(format!(".{}", name.to_string_lossy()));
    partial
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation: Option<String>,
    ) -> CoreResult<ObjectPage> {
        let bucket_path = self.bucket_path(bucket)?;
        let metadata = tokio::fs::metadata(&bucket_path)
            .await
            .map_err(|e| not_found_or_io(e, "bucket", bucket))?;
        if !metadata.is_dir() {
            return Err(CoreError::not_found("bucket", bucket));
        }

        // The directory is re-walked per page; continuation is the last key
        // handed out.
        let mut entries: Vec<ObjectDescriptor> = self
            .list_recursive(&bucket_path)
            .await?
            .into_iter()
            .filter(|(path, _)| {
                !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
            })
            .filter_map(|(path, len)| {
                path_to_key(&bucket_path, &path).map(|key| ObjectDescriptor::new(key, Some(len)))
            })
            .filter(|o| prefix.map_or(true, |p| o.key.starts_with(p)))
            .filter(|o| continuation.as_deref().map_or(true, |after| o.key.as_str() > after))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let next_continuation = if entries.len() > self.page_size {
            entries.truncate(self.page_size);
            entries.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ObjectPage {
            objects: entries,
            next_continuation,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> CoreResult<ObjectBody> {
        let path = self.object_path(bucket, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, "object", key))?;
        let content_length = file.metadata().await.ok().map(|m| m.len());

        Ok(ObjectBody {
            stream: ReaderStream::new(file).map_err(CoreError::from).boxed(),
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
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&path);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;

        let result: CoreResult<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        match result {
            Ok(()) => {
                tokio::fs::rename(&partial, &path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
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
        let from_path = self.object_path(source_bucket, source_key)?;
        let to_path = self.object_path(destination_bucket, destination_key)?;

        if !tokio::fs::try_exists(&from_path).await.unwrap_or(false) {
            return Err(CoreError::not_found("object", source_key));
        }

        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&to_path);
        if let Err(e) = tokio::fs::copy(&from_path, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(not_found_or_io(e, "object", source_key));
        }
        tokio::fs::rename(&partial, &to_path).await?;

        Ok(())
    }
}
