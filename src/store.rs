use std::path::Path;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use axum::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found in bucket")]
    NotFound(String),

    #[error("object transfer failed: {0}")]
    Transfer(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// One named object in a remote store, fetched to local scratch space and
/// deleted once a request has fully succeeded.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Downloads the object bytes into `dest`. A missing key or interrupted
    /// transfer propagates to the pipeline boundary.
    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), StoreError>;

    /// Deletes the source object. Invoked on pipeline success only; callers
    /// treat a failure here as best-effort cleanup and log it instead of
    /// failing the request.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// S3-compatible store client. The endpoint, bucket and static credentials
/// come from [`Config`], not from the request payload.
#[derive(Clone)]
pub struct R2Store {
    client: Client,
    bucket: String,
}

impl R2Store {
    pub fn new(config: &Config) -> Self {
        let credentials = Credentials::new(
            &config.store_access_key_id,
            &config.store_secret_access_key,
            None,
            None,
            "transcribe_runner",
        );
        let store_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.store_region.clone()))
            .endpoint_url(&config.store_endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(store_config),
            bucket: config.store_bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for R2Store {
    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Transfer(DisplayErrorContext(&err).to_string())
                }
            })?;

        let data = object
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Transfer(DisplayErrorContext(&err).to_string()))?
            .into_bytes();
        tokio::fs::write(dest, &data).await?;
        info!(key, bytes = data.len(), "object downloaded");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::Transfer(DisplayErrorContext(&err).to_string()))?;
        debug!(key, "source object deleted");
        Ok(())
    }
}

/// Request-scoped local buffer for the fetched audio. The backing file is
/// removed when the value drops, on every exit path of an invocation.
pub struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    pub fn create() -> std::io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("transcribe-")
            .suffix(".audio")
            .tempfile()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_file_is_removed_on_drop() {
        let scratch = ScratchFile::create().unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(&path, b"audio").unwrap();
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }
}
