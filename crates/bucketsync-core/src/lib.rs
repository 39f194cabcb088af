//! Core domain types for bucket replication: configuration, object
//! descriptors, destination key mapping and the shared error type.

pub mod config;
pub mod error;
pub mod key;
pub mod object;

pub use config::{
    BucketEndpoint, ConfigSources, ConfigurationError, Credentials, EndpointRole,
    ReplicationConfig, RetryPolicy, TransferOptions,
};
pub use error::{CoreError, CoreResult};
pub use key::{is_canonical, map_destination_key, normalize_key};
pub use object::{ObjectDescriptor, ObjectPage};
