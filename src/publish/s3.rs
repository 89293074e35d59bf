//! AWS S3 dataset host.
//!
//! Layout under `{bucket}/{prefix}/{dataset}/`:
//! - `versions/{n}/{file}` for every exported file
//! - `index.json`, written after all files of a version are in place

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{AppError, Result};
use crate::models::{DatasetVersion, LongTermConfig, VersionIndex};
use crate::publish::{DatasetHost, INDEX_FILE};
use crate::utils::fs::list_files;

pub struct S3DatasetHost {
    client: Client,
    bucket: String,
    prefix: String,
    dataset: String,
}

impl S3DatasetHost {
    pub fn new(
        client: Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            dataset: dataset.into(),
        }
    }

    /// Create the host with credentials from the default AWS chain.
    pub async fn from_config(config: &LongTermConfig) -> Result<Self> {
        let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self::new(
            Client::new(&aws),
            &config.s3_bucket,
            &config.s3_prefix,
            &config.dataset,
        ))
    }

    fn key(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.prefix.trim_end_matches('/'),
            self.dataset,
            path
        )
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| AppError::S3(e.to_string()))?;
        log::debug!("Wrote s3://{}/{}", self.bucket, key);
        Ok(())
    }
}

#[async_trait]
impl DatasetHost for S3DatasetHost {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn fetch_index(&self) -> Result<VersionIndex> {
        let key = self.key(INDEX_FILE);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| AppError::S3(e.to_string()))?;
                Ok(serde_json::from_slice(&bytes.into_bytes())?)
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    log::info!("No existing index at s3://{}/{}", self.bucket, key);
                    Ok(VersionIndex::new(&self.dataset))
                } else {
                    Err(AppError::S3(service_err.to_string()))
                }
            }
        }
    }

    async fn upload_version(&self, version: &DatasetVersion, export_dir: &Path) -> Result<()> {
        let files = list_files(export_dir).await?;
        for file in &files {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let bytes = tokio::fs::read(file).await?;
            self.put(&self.key(&format!("versions/{}/{}", version.version, name)), bytes)
                .await?;
        }

        // The index makes the version visible.
        let index = tokio::fs::read(export_dir.join(INDEX_FILE)).await?;
        self.put(&self.key(INDEX_FILE), index).await?;
        log::info!(
            "Uploaded {} files as version {} to s3://{}",
            files.len(),
            version.version,
            self.bucket
        );
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| AppError::S3(e.to_string()))?;
        Ok(())
    }
}
