//! Directory-backed dataset host.
//!
//! ```text
//! {root}/
//! ├── index.json
//! └── versions/
//!     ├── 1/
//!     └── 2/
//! ```
//!
//! A version directory is filled under a hidden name and renamed into place;
//! `index.json` is rewritten last. Only versions listed in the index count:
//! a version directory without an index entry is replaced on the next upload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{DatasetVersion, VersionIndex};
use crate::publish::{DatasetHost, INDEX_FILE};
use crate::utils::fs::{list_files, read_json, remove_dir_if_exists, write_atomic};

pub struct LocalDatasetHost {
    root: PathBuf,
    dataset: String,
}

impl LocalDatasetHost {
    pub fn new(root: impl Into<PathBuf>, dataset: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dataset: dataset.into(),
        }
    }

    pub fn version_dir(&self, version: u64) -> PathBuf {
        self.root.join("versions").join(version.to_string())
    }
}

#[async_trait]
impl DatasetHost for LocalDatasetHost {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch_index(&self) -> Result<VersionIndex> {
        Ok(read_json(&self.root.join(INDEX_FILE))
            .await?
            .unwrap_or_else(|| VersionIndex::new(&self.dataset)))
    }

    async fn upload_version(&self, version: &DatasetVersion, export_dir: &Path) -> Result<()> {
        let index_bytes = tokio::fs::read(export_dir.join(INDEX_FILE)).await?;
        let target = self.version_dir(version.version);
        if target.exists() {
            if self.fetch_index().await?.versions.contains_key(&version.version) {
                return Err(AppError::publish(format!(
                    "version {} already exists in {}",
                    version.version,
                    self.root.display()
                )));
            }
            log::warn!(
                "Replacing unindexed version directory {}",
                target.display()
            );
            remove_dir_if_exists(&target).await?;
        }
        let partial = self
            .root
            .join("versions")
            .join(format!(".{}.partial", version.version));
        remove_dir_if_exists(&partial).await?;
        tokio::fs::create_dir_all(&partial).await?;

        let files = list_files(export_dir).await?;
        for file in &files {
            if let Some(name) = file.file_name() {
                tokio::fs::copy(file, partial.join(name)).await?;
            }
        }
        tokio::fs::rename(&partial, &target).await?;
        write_atomic(&self.root.join(INDEX_FILE), &index_bytes).await?;

        log::info!(
            "Stored {} files as version {} in {}",
            files.len(),
            version.version,
            target.display()
        );
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn version() -> DatasetVersion {
        DatasetVersion {
            version: 1,
            scrape_date: "2025-01-01".parse().unwrap(),
            created_at: Utc::now(),
            cutoff: Utc::now(),
            manifest: Vec::new(),
        }
    }

    async fn export(tmp: &TempDir, version: &DatasetVersion) -> PathBuf {
        let mut index = VersionIndex::new("test");
        index.record(version);

        let export = tmp.path().join("export");
        tokio::fs::create_dir_all(&export).await.unwrap();
        tokio::fs::write(export.join("a.csv"), b"chain\n").await.unwrap();
        tokio::fs::write(export.join(INDEX_FILE), serde_json::to_vec(&index).unwrap())
            .await
            .unwrap();
        export
    }

    #[tokio::test]
    async fn test_upload_and_index() {
        let tmp = TempDir::new().unwrap();
        let host = LocalDatasetHost::new(tmp.path().join("remote"), "test");
        assert!(host.fetch_index().await.unwrap().versions.is_empty());
        let version = version();
        let export = export(&tmp, &version).await;

        host.upload_version(&version, &export).await.unwrap();

        assert!(host.version_dir(1).join("a.csv").exists());
        let fetched = host.fetch_index().await.unwrap();
        assert_eq!(fetched.next_version(), 2);

        // Same version number twice is refused.
        assert!(host.upload_version(&version, &export).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_after_failed_index_write() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("remote");
        let host = LocalDatasetHost::new(&root, "test");
        let version = version();
        let export = export(&tmp, &version).await;

        // A directory where the index temp file goes makes the index write fail.
        let blocker = root.join(INDEX_FILE).with_extension("tmp");
        tokio::fs::create_dir_all(&blocker).await.unwrap();
        assert!(host.upload_version(&version, &export).await.is_err());
        assert!(host.version_dir(1).exists());
        assert!(host.fetch_index().await.unwrap().versions.is_empty());

        tokio::fs::remove_dir(&blocker).await.unwrap();
        host.upload_version(&version, &export).await.unwrap();

        assert!(host.version_dir(1).join("a.csv").exists());
        assert!(host.fetch_index().await.unwrap().versions.contains_key(&1));
    }
}
