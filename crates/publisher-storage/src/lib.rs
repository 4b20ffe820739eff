//! Object store backends for the package publisher.
//!
//! This crate provides the [`ObjectStore`] trait that the lock, release-marker
//! and CDN crates are written against, plus implementations for the local
//! filesystem (a mounted bucket), memory (tests and single-process runs) and
//! Amazon S3 (feature `s3`).
//!
//! Every backend reports a missing object as [`StorageError::NotFound`]; that
//! is the one storage outcome callers are allowed to recover from.
//!
//! # Example
//!
//! ```
//! use publisher_storage::{MemoryStorage, ObjectStore, PutOptions, StorageType};
//!
//! let storage = MemoryStorage::new("downloads");
//!
//! storage.put("releases/releases.json", b"[]", &PutOptions::default()).expect("put");
//! let data = storage.get("releases/releases.json").expect("get");
//! assert_eq!(data, b"[]");
//!
//! assert!(storage.get("missing").unwrap_err().is_not_found());
//! assert_eq!(storage.storage_type(), StorageType::Memory);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod file;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use file::FileStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "s3")]
pub use s3::S3Storage;

/// Errors returned by [`ObjectStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The object does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Local I/O failed.
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote backend rejected or failed the request.
    #[error("{op} {bucket}/{key} failed: {message}")]
    Backend {
        op: Operation,
        bucket: String,
        key: String,
        message: String,
    },

    /// The key cannot be mapped onto this backend.
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Backend configuration is incomplete or inconsistent.
    #[error("invalid storage configuration: {0}")]
    Config(String),

    /// The backend was not compiled into this build.
    #[error("{0} storage is not available in this build (enable the `{1}` feature)")]
    Unavailable(StorageType, &'static str),
}

impl StorageError {
    /// Whether this error means the object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub(crate) fn not_found(bucket: &str, key: &str) -> Self {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn backend(op: Operation, bucket: &str, key: &str, message: impl Into<String>) -> Self {
        StorageError::Backend {
            op,
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Store operation, used in error messages and for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Put,
    Delete,
    Head,
    List,
    ReplaceMetadata,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::Head => "head",
            Operation::List => "list",
            Operation::ReplaceMetadata => "replace-metadata",
        };
        f.write_str(name)
    }
}

/// Represents the type of storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Local filesystem, typically a mounted bucket
    #[default]
    File,
    /// Process-local memory
    Memory,
    /// Amazon S3
    S3,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::Memory => write!(f, "memory"),
            StorageType::S3 => write!(f, "s3"),
        }
    }
}

impl FromStr for StorageType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" | "local" => Ok(StorageType::File),
            "memory" | "mem" => Ok(StorageType::Memory),
            "s3" => Ok(StorageType::S3),
            other => Err(StorageError::Config(format!("unknown storage type: {other}"))),
        }
    }
}

/// Asynchronous replication state reported for an object.
///
/// Only [`ReplicationStatus::Completed`] is terminal. An object with no
/// replication rule reports no status at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ReplicationStatus {
    Completed,
    Pending,
    Failed,
    Replica,
    Other(String),
}

impl ReplicationStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReplicationStatus::Completed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReplicationStatus::Completed => "COMPLETED",
            ReplicationStatus::Pending => "PENDING",
            ReplicationStatus::Failed => "FAILED",
            ReplicationStatus::Replica => "REPLICA",
            ReplicationStatus::Other(s) => s,
        }
    }
}

impl From<&str> for ReplicationStatus {
    fn from(value: &str) -> Self {
        // Only the exact S3 wire value is terminal. The SDK constant
        // `COMPLETE` is never sent, so it stays in flight like any unknown value.
        match value {
            "COMPLETED" => ReplicationStatus::Completed,
            "PENDING" => ReplicationStatus::Pending,
            "FAILED" => ReplicationStatus::Failed,
            "REPLICA" => ReplicationStatus::Replica,
            _ => ReplicationStatus::Other(value.to_string()),
        }
    }
}

impl From<String> for ReplicationStatus {
    fn from(value: String) -> Self {
        ReplicationStatus::from(value.as_str())
    }
}

impl From<ReplicationStatus> for String {
    fn from(status: ReplicationStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object metadata returned by [`ObjectStore::head`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// `None` when replication is not configured for the object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_status: Option<ReplicationStatus>,
    /// User-defined metadata (`x-amz-meta-*` on S3, without the prefix).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Options applied when writing an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Object tags as a URL-encoded query string, passed to the backend as is.
    /// Callers encode keys and values (see `ResourceTags::to_query`).
    pub tagging: Option<String>,
    pub content_type: Option<String>,
}

impl PutOptions {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    pub fn with_tagging(mut self, tagging: impl Into<String>) -> Self {
        let tagging = tagging.into();
        self.tagging = (!tagging.is_empty()).then_some(tagging);
        self
    }
}

/// Common trait for all object stores.
///
/// Objects are whole blobs: there is no append or partial write, and no
/// conditional (compare-and-swap) put. Implementations must be usable from
/// several threads.
pub trait ObjectStore: Send + Sync {
    /// Read an object's contents.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or overwrite an object.
    fn put(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()>;

    /// Delete an object. Deleting a missing object succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Read an object's metadata without its contents.
    fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// List the "folders" directly below `prefix`, using `/` as delimiter.
    ///
    /// Returned prefixes include the trailing `/`, e.g. listing
    /// `repo/yum/` yields `repo/yum/el/`, `repo/yum/sles/`.
    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>>;

    /// Replace an existing object's user metadata, keeping its contents.
    fn replace_metadata(&self, key: &str, metadata: &BTreeMap<String, String>) -> Result<()>;

    /// Get the storage type
    fn storage_type(&self) -> StorageType;

    /// Get the bucket name
    fn bucket(&self) -> &str;

    /// Check whether an object exists.
    fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()> {
        (**self).put(key, data, options)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn head(&self, key: &str) -> Result<ObjectMeta> {
        (**self).head(key)
    }

    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list_prefixes(prefix)
    }

    fn replace_metadata(&self, key: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        (**self).replace_metadata(key, metadata)
    }

    fn storage_type(&self) -> StorageType {
        (**self).storage_type()
    }

    fn bucket(&self) -> &str {
        (**self).bucket()
    }
}

/// Join object key segments with `/`, collapsing duplicate separators.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Configuration for a storage backend bound to one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStorageConfig {
    /// Storage type (file, memory, s3)
    #[serde(default)]
    pub storage_type: StorageType,
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Role assumed before talking to the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    /// Root directory for file storage
    #[serde(default)]
    pub base_path: String,
    /// Custom endpoint (for S3-compatible services like MinIO or LocalStack)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl CloudStorageConfig {
    pub fn new(storage_type: StorageType, bucket: impl Into<String>) -> Self {
        Self {
            storage_type,
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// File storage rooted at `base_path`; the bucket becomes a subdirectory.
    pub fn file(base_path: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::File,
            base_path: base_path.into(),
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub fn s3(bucket: impl Into<String>) -> Self {
        Self::new(StorageType::S3, bucket)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.storage_type {
            StorageType::File => {
                if self.base_path.is_empty() {
                    return Err(StorageError::Config(
                        "base_path is required for file storage".to_string(),
                    ));
                }
            }
            StorageType::Memory => {}
            StorageType::S3 => {
                if self.bucket.is_empty() {
                    return Err(StorageError::Config(
                        "bucket name is required for s3 storage".to_string(),
                    ));
                }
                if self.region.as_deref().unwrap_or_default().is_empty() {
                    return Err(StorageError::Config(
                        "region is required for s3 storage".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Build a storage backend from configuration.
pub fn build_storage_backend(config: &CloudStorageConfig) -> Result<Arc<dyn ObjectStore>> {
    config.validate()?;

    match config.storage_type {
        StorageType::File => Ok(Arc::new(FileStorage::for_bucket(
            PathBuf::from(&config.base_path),
            &config.bucket,
        ))),
        StorageType::Memory => Ok(Arc::new(MemoryStorage::new(config.bucket.clone()))),
        #[cfg(feature = "s3")]
        StorageType::S3 => Ok(Arc::new(S3Storage::connect(config)?)),
        #[cfg(not(feature = "s3"))]
        StorageType::S3 => Err(StorageError::Unavailable(StorageType::S3, "s3")),
    }
}
