//! Configuration resolution for a replication run
//!
//! Every setting is a flat key named after its environment variable
//! (`SOURCE_BUCKET`, `DESTINATION_PREFIX`, `BUCKETSYNC_CONCURRENCY`, ...).
//! Sources, lowest precedence first:
//! 1. Hardcoded defaults
//! 2. A dotenv-style file (`KEY=value` lines)
//! 3. A settings file (YAML/TOML/JSON, picked by extension)
//! 4. Process environment variables
//! 5. Explicit overrides (command-line flags)
//!
//! The resolved [`ReplicationConfig`] is an immutable value built once at
//! startup and passed by reference to the client factory and the engine.

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Smallest part size S3 accepts for all but the last part of a multipart upload.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default streaming part size.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound on parallel object transfers.
pub const MAX_CONCURRENCY: usize = 64;

const REQUIRED_FIELDS: [&str; 4] = [
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_REGION",
    "BUCKET",
];

/// Errors raised while resolving configuration. Always fatal, always raised
/// before any client is constructed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// One or more mandatory keys are absent or empty.
    #[error("missing required configuration keys: {}", .0.join(", "))]
    Missing(Vec<String>),

    /// A key is present but its value is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A configuration source could not be read or parsed.
    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}

/// Which side of the replication an endpoint describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Source,
    Destination,
}

impl EndpointRole {
    /// Prefix of this role's configuration keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            EndpointRole::Source => "SOURCE",
            EndpointRole::Destination => "DESTINATION",
        }
    }

    fn key(&self, field: &str) -> String {
        format!("{}_{}", self.key_prefix(), field)
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Source => write!(f, "source"),
            EndpointRole::Destination => write!(f, "destination"),
        }
    }
}

/// Static access credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Transport retry policy applied inside the object store client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first one
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 20_000,
        }
    }
}

impl RetryPolicy {
    /// Get initial backoff duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get maximum backoff duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Everything needed to talk to one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEndpoint {
    pub role: EndpointRole,
    pub bucket: String,
    pub credentials: Credentials,
    pub region: String,
    /// Custom endpoint (MinIO, Wasabi, `file:///srv/buckets`); `None` means AWS
    pub endpoint_url: Option<String>,
    /// Verify the server's TLS certificate
    pub verify_tls: bool,
    pub retry: RetryPolicy,
}

impl BucketEndpoint {
    pub fn new(
        role: EndpointRole,
        bucket: impl Into<String>,
        region: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            role,
            bucket: bucket.into(),
            credentials,
            region: region.into(),
            endpoint_url: None,
            verify_tls: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn normalized_endpoint(&self) -> Option<&str> {
        self.endpoint_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
    }

    /// True when both endpoints sit behind the same provider and account, so
    /// one client can read the source and write the destination.
    pub fn same_account(&self, other: &BucketEndpoint) -> bool {
        self.normalized_endpoint() == other.normalized_endpoint()
            && self.region == other.region
            && self.credentials.access_key_id == other.credentials.access_key_id
    }

    /// Endpoint label for log lines.
    pub fn display_endpoint(&self) -> &str {
        self.endpoint_url.as_deref().unwrap_or("aws-default")
    }
}

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Never use server-side copy
    pub force_streamed: bool,
    /// Report byte-level progress (implies streaming)
    pub progress: bool,
    /// Objects transferred in parallel
    pub concurrency: usize,
    /// Multipart part size for streamed uploads
    pub part_size: usize,
    /// Plan and report, write nothing
    pub dry_run: bool,
    /// Only replicate source keys starting with this prefix
    pub source_prefix: Option<String>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            force_streamed: false,
            progress: false,
            concurrency: 1,
            part_size: DEFAULT_PART_SIZE,
            dry_run: false,
            source_prefix: None,
        }
    }
}

impl TransferOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigurationError::Invalid(format!(
                "BUCKETSYNC_CONCURRENCY must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.concurrency
            )));
        }
        if self.part_size < MIN_PART_SIZE {
            return Err(ConfigurationError::Invalid(format!(
                "BUCKETSYNC_PART_SIZE must be at least {} bytes, got {}",
                MIN_PART_SIZE, self.part_size
            )));
        }
        Ok(())
    }
}

/// Fully resolved configuration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub source: BucketEndpoint,
    pub destination: BucketEndpoint,
    pub destination_prefix: String,
    pub transfer: TransferOptions,
}

/// Where [`ReplicationConfig::resolve`] reads its values from.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    env_file: Option<(PathBuf, bool)>,
    settings_file: Option<PathBuf>,
    process_env: bool,
    overrides: Vec<(String, String)>,
}

impl Default for ConfigSources {
    fn default() -> Self {
        Self {
            env_file: None,
            settings_file: None,
            process_env: true,
            overrides: Vec::new(),
        }
    }
}

impl ConfigSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `KEY=value` lines from `path`. A missing optional file is skipped.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>, required: bool) -> Self {
        self.env_file = Some((path.into(), required));
        self
    }

    pub fn with_settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    /// Ignore process environment variables.
    pub fn without_process_env(mut self) -> Self {
        self.process_env = false;
        self
    }

    /// Highest-precedence value for `key` (e.g. from a command-line flag).
    pub fn with_override(mut self, key: &str, value: impl Into<String>) -> Self {
        self.overrides.push((key.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_override_opt(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with_override(key, value),
            None => self,
        }
    }
}

impl ReplicationConfig {
    /// Resolve and validate configuration from `sources`.
    ///
    /// All mandatory keys of both endpoints are checked together so the
    /// error names every missing key at once.
    pub fn resolve(sources: &ConfigSources) -> Result<Self, ConfigurationError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        if let Some((path, required)) = &sources.env_file {
            builder = builder.add_source(
                File::new(&path.to_string_lossy(), FileFormat::Ini).required(*required),
            );
        }
        if let Some(path) = &sources.settings_file {
            builder = builder.add_source(File::from(path.as_path()));
        }
        if sources.process_env {
            builder = builder.add_source(Environment::default());
        }
        for (key, value) in &sources.overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }

        let settings = Settings(builder.build()?);

        let mut missing = Vec::new();
        for role in [EndpointRole::Source, EndpointRole::Destination] {
            for field in REQUIRED_FIELDS {
                let key = role.key(field);
                if settings.string(&key).is_none() {
                    missing.push(key);
                }
            }
        }
        if !missing.is_empty() {
            return Err(ConfigurationError::Missing(missing));
        }

        let retry = RetryPolicy {
            max_attempts: settings.number("BUCKETSYNC_MAX_ATTEMPTS")?,
            initial_backoff_ms: settings.number("BUCKETSYNC_INITIAL_BACKOFF_MS")?,
            max_backoff_ms: settings.number("BUCKETSYNC_MAX_BACKOFF_MS")?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "BUCKETSYNC_MAX_ATTEMPTS must be > 0".to_string(),
            ));
        }

        let source = settings.endpoint(EndpointRole::Source, &retry)?;
        let destination = settings.endpoint(EndpointRole::Destination, &retry)?;

        let transfer = TransferOptions {
            force_streamed: settings.flag("BUCKETSYNC_FORCE_STREAMED")?,
            progress: settings.flag("BUCKETSYNC_PROGRESS")?,
            concurrency: settings.number("BUCKETSYNC_CONCURRENCY")?,
            part_size: settings.number("BUCKETSYNC_PART_SIZE")?,
            dry_run: settings.flag("BUCKETSYNC_DRY_RUN")?,
            source_prefix: settings.string("BUCKETSYNC_SOURCE_PREFIX"),
        };

        let config = ReplicationConfig {
            source,
            destination,
            destination_prefix: settings.string("DESTINATION_PREFIX").unwrap_or_default(),
            transfer,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set default values for all optional keys
    fn set_defaults(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigurationError> {
        let retry = RetryPolicy::default();
        let transfer = TransferOptions::default();
        Ok(builder
            .set_default("source_verify_tls", true)?
            .set_default("destination_verify_tls", true)?
            .set_default("destination_prefix", "")?
            .set_default("bucketsync_max_attempts", retry.max_attempts)?
            .set_default("bucketsync_initial_backoff_ms", retry.initial_backoff_ms)?
            .set_default("bucketsync_max_backoff_ms", retry.max_backoff_ms)?
            .set_default("bucketsync_force_streamed", transfer.force_streamed)?
            .set_default("bucketsync_progress", transfer.progress)?
            .set_default("bucketsync_concurrency", transfer.concurrency as u64)?
            .set_default("bucketsync_part_size", transfer.part_size as u64)?
            .set_default("bucketsync_dry_run", transfer.dry_run)?)
    }

    /// Validate values that are not checked during resolution.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.transfer.validate()
    }
}

/// Case-tolerant view over the merged sources.
///
/// Environment keys arrive lowercased while dotenv keys may keep their case,
/// so every lookup tries both spellings.
struct Settings(Config);

impl Settings {
    fn raw<T, F>(&self, key: &str, get: F) -> Option<Result<T, config::ConfigError>>
    where
        F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
    {
        let lower = key.to_ascii_lowercase();
        for candidate in [lower.as_str(), key] {
            match get(&self.0, candidate) {
                Err(config::ConfigError::NotFound(_)) => continue,
                other => return Some(other),
            }
        }
        None
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key, Config::get_string)
            .and_then(Result::ok)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigurationError> {
        match self.raw(key, Config::get_bool) {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(ConfigurationError::Invalid(format!("{}: {}", key, e))),
            None => Ok(false),
        }
    }

    fn number<T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: TryFrom<i64>,
    {
        let value = match self.raw(key, Config::get_int) {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                return Err(ConfigurationError::Invalid(format!("{}: {}", key, e)));
            }
            None => {
                return Err(ConfigurationError::Invalid(format!("{} has no value", key)));
            }
        };
        T::try_from(value).map_err(|_| {
            ConfigurationError::Invalid(format!("{} is out of range: {}", key, value))
        })
    }

    fn endpoint(
        &self,
        role: EndpointRole,
        retry: &RetryPolicy,
    ) -> Result<BucketEndpoint, ConfigurationError> {
        let required = |field: &str| {
            let key = role.key(field);
            self.string(&key)
                .ok_or(ConfigurationError::Missing(vec![key]))
        };

        Ok(BucketEndpoint {
            role,
            bucket: required("BUCKET")?,
            credentials: Credentials::new(
                required("AWS_ACCESS_KEY_ID")?,
                required("AWS_SECRET_ACCESS_KEY")?,
            ),
            region: required("AWS_REGION")?,
            endpoint_url: self.string(&role.key("ENDPOINT_URL")),
            verify_tls: self.flag(&role.key("VERIFY_TLS"))?,
            retry: retry.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn complete_sources() -> ConfigSources {
        ConfigSources::new()
            .without_process_env()
            .with_override("SOURCE_AWS_ACCESS_KEY_ID", "src-key")
            .with_override("SOURCE_AWS_SECRET_ACCESS_KEY", "src-secret")
            .with_override("SOURCE_AWS_REGION", "us-east-1")
            .with_override("SOURCE_BUCKET", "photos")
            .with_override("DESTINATION_AWS_ACCESS_KEY_ID", "dst-key")
            .with_override("DESTINATION_AWS_SECRET_ACCESS_KEY", "dst-secret")
            .with_override("DESTINATION_AWS_REGION", "eu-west-1")
            .with_override("DESTINATION_BUCKET", "photos-backup")
    }

    #[test]
    fn test_resolve_with_defaults() {
        let config = ReplicationConfig::resolve(&complete_sources()).unwrap();

        assert_eq!(config.source.bucket, "photos");
        assert_eq!(config.source.role, EndpointRole::Source);
        assert_eq!(config.destination.region, "eu-west-1");
        assert_eq!(config.destination_prefix, "");
        assert!(config.source.verify_tls);
        assert!(config.source.endpoint_url.is_none());
        assert_eq!(config.source.retry.max_attempts, 10);
        assert_eq!(config.transfer, TransferOptions::default());
    }

    #[test]
    fn test_missing_keys_are_all_reported() {
        let err = ReplicationConfig::resolve(&ConfigSources::new().without_process_env())
            .unwrap_err();

        match err {
            ConfigurationError::Missing(keys) => {
                assert_eq!(keys.len(), 8);
                assert!(keys.contains(&"SOURCE_AWS_ACCESS_KEY_ID".to_string()));
                assert!(keys.contains(&"SOURCE_BUCKET".to_string()));
                assert!(keys.contains(&"DESTINATION_AWS_REGION".to_string()));
                assert!(keys.contains(&"DESTINATION_AWS_SECRET_ACCESS_KEY".to_string()));
            }
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let sources = complete_sources().with_override("DESTINATION_BUCKET", "  ");
        let err = ReplicationConfig::resolve(&sources).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required configuration keys: DESTINATION_BUCKET"
        );
    }

    #[test]
    fn test_overrides_tuning() {
        let sources = complete_sources()
            .with_override("DESTINATION_PREFIX", "mirror/2024")
            .with_override("SOURCE_VERIFY_TLS", "false")
            .with_override("SOURCE_ENDPOINT_URL", "https://minio.internal:9000")
            .with_override("BUCKETSYNC_CONCURRENCY", "4")
            .with_override("BUCKETSYNC_FORCE_STREAMED", "true")
            .with_override("BUCKETSYNC_MAX_ATTEMPTS", "3");

        let config = ReplicationConfig::resolve(&sources).unwrap();

        assert_eq!(config.destination_prefix, "mirror/2024");
        assert!(!config.source.verify_tls);
        assert!(config.destination.verify_tls);
        assert_eq!(
            config.source.endpoint_url.as_deref(),
            Some("https://minio.internal:9000")
        );
        assert_eq!(config.transfer.concurrency, 4);
        assert!(config.transfer.force_streamed);
        assert_eq!(config.destination.retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_concurrency() {
        let sources = complete_sources().with_override("BUCKETSYNC_CONCURRENCY", "0");
        assert!(matches!(
            ReplicationConfig::resolve(&sources),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_part_size_below_minimum() {
        let sources = complete_sources().with_override("BUCKETSYNC_PART_SIZE", "1024");
        assert!(matches!(
            ReplicationConfig::resolve(&sources),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SOURCE_AWS_ACCESS_KEY_ID=file-key").unwrap();
        writeln!(file, "SOURCE_BUCKET=from-file").unwrap();
        file.flush().unwrap();

        let sources = ConfigSources::new()
            .without_process_env()
            .with_env_file(file.path(), true)
            .with_override("SOURCE_AWS_SECRET_ACCESS_KEY", "s")
            .with_override("SOURCE_AWS_REGION", "us-east-1")
            .with_override("DESTINATION_AWS_ACCESS_KEY_ID", "d")
            .with_override("DESTINATION_AWS_SECRET_ACCESS_KEY", "d")
            .with_override("DESTINATION_AWS_REGION", "us-east-1")
            .with_override("DESTINATION_BUCKET", "to")
            .with_override("SOURCE_BUCKET", "from-flag");

        let config = ReplicationConfig::resolve(&sources).unwrap();

        assert_eq!(config.source.credentials.access_key_id, "file-key");
        // Overrides beat the file
        assert_eq!(config.source.bucket, "from-flag");
    }

    #[test]
    fn test_optional_env_file_may_be_absent() {
        let sources = complete_sources().with_env_file("/nonexistent/bucketsync.env", false);
        assert!(ReplicationConfig::resolve(&sources).is_ok());
    }

    #[test]
    fn test_same_account() {
        let creds = Credentials::new("key", "secret");
        let a = BucketEndpoint::new(EndpointRole::Source, "a", "us-east-1", creds.clone())
            .with_endpoint_url("http://minio:9000/");
        let b = BucketEndpoint::new(EndpointRole::Destination, "b", "us-east-1", creds.clone())
            .with_endpoint_url("http://minio:9000");
        let c = BucketEndpoint::new(EndpointRole::Destination, "c", "us-east-1", creds);

        assert!(a.same_account(&b));
        assert!(!a.same_account(&c));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("AKIA123", "top-secret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIA123"));
        assert!(!debug.contains("top-secret"));
    }
}
