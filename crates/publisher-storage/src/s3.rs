//! Amazon S3 backend.
//!
//! The [`ObjectStore`] trait is blocking, so the backend owns a small
//! current-thread runtime and drives each SDK call to completion on it. Call
//! it from plain threads or from `spawn_blocking`, never directly from an
//! async task.

use std::collections::{BTreeMap, HashMap};

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::MetadataDirective;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::{
    CloudStorageConfig, ObjectMeta, ObjectStore, Operation, PutOptions, ReplicationStatus, Result,
    StorageError, StorageType,
};

const SESSION_NAME: &str = "publisher";

/// Unreserved characters and the path separator pass through in a copy source.
const COPY_SOURCE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// `x-amz-copy-source` value for `key` in `bucket`. S3 decodes the header, so
/// keys with spaces, `+`, `?` or `%` must be escaped to name the right object.
fn copy_source(bucket: &str, key: &str) -> String {
    format!(
        "{bucket}/{}",
        utf8_percent_encode(key, COPY_SOURCE_ENCODE_SET)
    )
}

/// S3 bucket accessed through the AWS SDK.
pub struct S3Storage {
    client: Client,
    bucket: String,
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    /// Resolve credentials and build a client for `config.bucket`.
    ///
    /// When `role_arn` is set the role is assumed on top of the default
    /// credential chain.
    pub fn connect(config: &CloudStorageConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::Config(format!("failed to start s3 runtime: {e}")))?;

        let client = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = &config.region {
                loader = loader.region(Region::new(region.clone()));
            }
            if let Some(endpoint) = &config.endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            let sdk_config = loader.load().await;

            let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
            if let Some(role_arn) = &config.role_arn {
                let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn.clone())
                    .session_name(SESSION_NAME)
                    .configure(&sdk_config)
                    .build()
                    .await;
                builder = builder.credentials_provider(provider);
            }
            if config.endpoint.is_some() {
                builder = builder.force_path_style(true);
            }
            Client::from_conf(builder.build())
        });

        info!(
            bucket = %config.bucket,
            region = ?config.region,
            role = ?config.role_arn,
            "initialized s3 storage"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            runtime: Some(runtime),
        })
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(StorageError::Config("s3 runtime has shut down".to_string())),
        }
    }

    fn error<E>(&self, op: Operation, key: &str, err: E) -> StorageError
    where
        E: std::error::Error,
    {
        StorageError::backend(op, &self.bucket, key, DisplayErrorContext(err).to_string())
    }
}

impl Drop for S3Storage {
    fn drop(&mut self) {
        // The last handle may be released inside an async task.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl ObjectStore for S3Storage {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let request = self.client.get_object().bucket(&self.bucket).key(key);
        self.block_on(async {
            let output = match request.send().await {
                Ok(output) => output,
                Err(err) => {
                    if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                        return Err(StorageError::not_found(&self.bucket, key));
                    }
                    return Err(self.error(Operation::Get, key, err));
                }
            };
            let body = output
                .body
                .collect()
                .await
                .map_err(|e| self.error(Operation::Get, key, e))?;
            Ok(body.into_bytes().to_vec())
        })?
    }

    fn put(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .set_tagging(options.tagging.clone())
            .set_content_type(options.content_type.clone());
        self.block_on(request.send())?
            .map_err(|e| self.error(Operation::Put, key, e))?;
        debug!(bucket = %self.bucket, key, bytes = data.len(), "put object");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let request = self.client.delete_object().bucket(&self.bucket).key(key);
        self.block_on(request.send())?
            .map_err(|e| self.error(Operation::Delete, key, e))?;
        Ok(())
    }

    fn head(&self, key: &str) -> Result<ObjectMeta> {
        let request = self.client.head_object().bucket(&self.bucket).key(key);
        let output = match self.block_on(request.send())? {
            Ok(output) => output,
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    return Err(StorageError::not_found(&self.bucket, key));
                }
                return Err(self.error(Operation::Head, key, err));
            }
        };

        Ok(ObjectMeta {
            key: key.to_string(),
            size: output
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or_default(),
            replication_status: output
                .replication_status()
                .map(|status| ReplicationStatus::from(status.as_str())),
            metadata: output
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        })
    }

    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/")
                .set_continuation_token(token.take());
            let output = self
                .block_on(request.send())?
                .map_err(|e| self.error(Operation::List, prefix, e))?;

            prefixes.extend(
                output
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(prefixes)
    }

    fn replace_metadata(&self, key: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        let metadata: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // S3 metadata is immutable; copying the object onto itself replaces it.
        let request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(copy_source(&self.bucket, key))
            .set_metadata(Some(metadata))
            .metadata_directive(MetadataDirective::Replace);

        match self.block_on(request.send())? {
            Ok(_) => Ok(()),
            Err(err) => {
                // CopyObject has no modeled NoSuchKey variant.
                let message = DisplayErrorContext(&err).to_string();
                if message.contains("NoSuchKey") {
                    return Err(StorageError::not_found(&self.bucket, key));
                }
                Err(StorageError::backend(
                    Operation::ReplaceMetadata,
                    &self.bucket,
                    key,
                    message,
                ))
            }
        }
    }

    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_keeps_plain_keys_readable() {
        assert_eq!(
            copy_source("locks", "infrastructure_agent/nri-foo/lock"),
            "locks/infrastructure_agent/nri-foo/lock"
        );
    }

    #[test]
    fn copy_source_escapes_reserved_key_characters() {
        assert_eq!(
            copy_source("releases", "apps/nri foo+1?v=2%/release.json"),
            "releases/apps/nri%20foo%2B1%3Fv%3D2%25/release.json"
        );
    }
}
