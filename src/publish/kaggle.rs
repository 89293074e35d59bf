//! Kaggle dataset host over the public REST API.
//!
//! Upload flow: each file is registered with `blobs/upload`, its bytes are
//! PUT to the returned URL, then one `datasets/create/version` call binds all
//! blob tokens into a new version. Nothing is visible until that last call
//! succeeds.

use std::path::Path;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{DatasetVersion, LongTermConfig, VersionIndex};
use crate::publish::{DatasetHost, INDEX_FILE, version_notes};
use crate::utils::fs::list_files;
use crate::utils::http::create_async_client;

const TIMEOUT_SECS: u64 = 300;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BlobRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    content_length: u64,
    last_modified_epoch_seconds: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobResponse {
    token: String,
    create_url: String,
}

#[derive(Serialize)]
struct UploadFile {
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVersionRequest {
    version_notes: String,
    delete_old_versions: bool,
    files: Vec<UploadFile>,
}

#[derive(Deserialize, Default)]
struct CreateVersionResponse {
    #[serde(default)]
    error: Option<String>,
}

pub struct KaggleDatasetHost {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    dataset: String,
    username: String,
    key: String,
}

impl KaggleDatasetHost {
    pub fn new(config: &LongTermConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(TIMEOUT_SECS)?,
            api_base: config.kaggle_api_base.trim_end_matches('/').to_string(),
            owner: config.kaggle_owner.clone(),
            dataset: config.dataset.clone(),
            username: config.kaggle_username.clone(),
            key: config.kaggle_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.dataset)
    }

    /// Register one file and upload its bytes; returns the blob token.
    async fn upload_blob(&self, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::publish(format!("bad file name {}", path.display())))?;
        let bytes = tokio::fs::read(path).await?;

        let blob: BlobResponse = self
            .client
            .post(self.url("blobs/upload"))
            .basic_auth(&self.username, Some(&self.key))
            .json(&BlobRequest {
                kind: "dataset",
                name,
                content_length: bytes.len() as u64,
                last_modified_epoch_seconds: chrono::Utc::now().timestamp(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.client
            .put(&blob.create_url)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;

        log::debug!("Uploaded blob {}", name);
        Ok(blob.token)
    }
}

#[async_trait]
impl DatasetHost for KaggleDatasetHost {
    fn name(&self) -> &'static str {
        "kaggle"
    }

    async fn fetch_index(&self) -> Result<VersionIndex> {
        let response = self
            .client
            .get(self.url(&format!("datasets/download/{}/{}", self.slug(), INDEX_FILE)))
            .basic_auth(&self.username, Some(&self.key))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            log::info!("No index found for {}, starting fresh", self.slug());
            return Ok(VersionIndex::new(&self.dataset));
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn upload_version(&self, version: &DatasetVersion, export_dir: &Path) -> Result<()> {
        let mut files = Vec::new();
        for path in list_files(export_dir).await? {
            files.push(UploadFile {
                token: self.upload_blob(&path).await?,
            });
        }

        let response: CreateVersionResponse = self
            .client
            .post(self.url(&format!("datasets/create/version/{}", self.slug())))
            .basic_auth(&self.username, Some(&self.key))
            .json(&CreateVersionRequest {
                version_notes: version_notes(version),
                delete_old_versions: false,
                files,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.error {
            Some(error) if !error.is_empty() => Err(AppError::publish(format!(
                "kaggle refused version {}: {}",
                version.version, error
            ))),
            _ => Ok(()),
        }
    }

    async fn health(&self) -> Result<()> {
        self.client
            .get(self.url(&format!("datasets/view/{}", self.slug())))
            .basic_auth(&self.username, Some(&self.key))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
