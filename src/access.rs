// src/access.rs

//! Read-only access for the serving layer.
//!
//! Chains and file types come from `chain_index.json`; file listings and
//! content come from the short-term store, or from the local outputs mirror
//! when the short-term backend cannot be read back (the broker).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::heartbeat::{HealthStatus, check_health};
use crate::models::{Config, FileType, target_name};
use crate::pipeline::ChainIndex;
use crate::publish::DatasetHost;
use crate::storage::{FileStorage, Page, PageRequest, RecordFilter, RecordStorage};
use crate::utils::fs::read_json;

/// One stored file without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub file_name: String,
    pub ingested_at: chrono::DateTime<chrono::Utc>,
    pub size: usize,
    pub digest: String,
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub message: String,
}

impl ProbeResult {
    fn from_result(ok_message: &str, result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                healthy: true,
                message: ok_message.to_string(),
            },
            Err(e) => Self {
                healthy: false,
                message: e.to_string(),
            },
        }
    }
}

impl From<HealthStatus> for ProbeResult {
    fn from(status: HealthStatus) -> Self {
        Self {
            healthy: status.is_healthy(),
            message: status.message().to_string(),
        }
    }
}

/// The three probes a serving layer exposes.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub process: ProbeResult,
    pub short_term: ProbeResult,
    pub long_term: ProbeResult,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.process.healthy && self.short_term.healthy && self.long_term.healthy
    }
}

pub struct AccessLayer {
    index_path: PathBuf,
    heartbeat_path: PathBuf,
    max_age: Duration,
    short_term: Arc<dyn RecordStorage>,
    outputs: Arc<FileStorage>,
    host: Arc<dyn DatasetHost>,
}

impl AccessLayer {
    pub fn new(
        config: &Config,
        short_term: Arc<dyn RecordStorage>,
        host: Arc<dyn DatasetHost>,
    ) -> Self {
        Self {
            index_path: config.paths.chain_index_file(),
            heartbeat_path: config.paths.heartbeat_file(),
            max_age: Duration::from_secs(config.health.max_age_secs),
            short_term,
            outputs: Arc::new(FileStorage::new(
                config.paths.outputs_dir(),
                config.storage.max_write_attempts,
            )),
            host,
        }
    }

    async fn index(&self) -> Result<ChainIndex> {
        Ok(read_json(&self.index_path).await?.unwrap_or_default())
    }

    /// Chains with indexed data.
    pub async fn list_chains(&self) -> Result<Vec<String>> {
        Ok(self.index().await?.chains().map(str::to_string).collect())
    }

    /// File types stored for `chain`.
    pub async fn list_file_types(&self, chain: &str) -> Result<Vec<FileType>> {
        let index = self.index().await?;
        if !index.chains.contains_key(&chain.to_uppercase()) {
            return Err(AppError::validation(format!("unknown chain '{chain}'")));
        }
        Ok(index.file_types(chain))
    }

    /// One page of records for a chain and file type.
    pub async fn content(
        &self,
        chain: &str,
        file_type: FileType,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page> {
        let target = target_name(chain, file_type);
        match self.short_term.read_records(&target, filter, page).await {
            Err(e) if e.is_unsupported() => {
                log::debug!("{}; reading {} from outputs", e, target);
                self.outputs.read_records(&target, filter, page).await
            }
            other => other,
        }
    }

    /// One page of file summaries for a chain and file type.
    pub async fn list_files(
        &self,
        chain: &str,
        file_type: FileType,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<(Vec<FileSummary>, Option<PageRequest>)> {
        let page_of = self.content(chain, file_type, filter, page).await?;
        let next = page_of.next.map(|cursor| page.next(cursor));
        let files = page_of
            .records
            .iter()
            .map(|r| FileSummary {
                file_name: r.file_name.clone(),
                ingested_at: r.ingested_at,
                size: r.content.len(),
                digest: r.digest(),
            })
            .collect();
        Ok((files, next))
    }

    /// Process liveness from the heartbeat file.
    pub async fn process_health(&self) -> ProbeResult {
        check_health(&self.heartbeat_path, self.max_age).await.into()
    }

    pub async fn short_term_health(&self) -> ProbeResult {
        ProbeResult::from_result(
            &format!("{} store reachable", self.short_term.backend()),
            self.short_term.health().await,
        )
    }

    pub async fn long_term_health(&self) -> ProbeResult {
        ProbeResult::from_result(
            &format!("{} host reachable", self.host.name()),
            self.host.health().await,
        )
    }

    pub async fn health(&self) -> HealthReport {
        let (process, short_term, long_term) = tokio::join!(
            self.process_health(),
            self.short_term_health(),
            self.long_term_health()
        );
        HealthReport {
            process,
            short_term,
            long_term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StorageRecord;
    use crate::pipeline::build_chain_index;
    use crate::publish::LocalDatasetHost;
    use crate::storage::{BrokerMessage, BrokerStorage, MessageProducer};
    use crate::utils::fs::write_json;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.app_data = tmp.path().to_path_buf();
        config
    }

    fn record(name: &str, minute: i64) -> StorageRecord {
        StorageRecord::new(
            "SHUFERSAL",
            FileType::PriceFile,
            name,
            "<prices/>",
            DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::minutes(minute),
        )
    }

    async fn seed(config: &Config, storage: &FileStorage) {
        let records: Vec<_> = (0..5).map(|i| record(&format!("Price-{i}.xml"), i)).collect();
        storage
            .write_records("price_file_shufersal", &records)
            .await
            .unwrap();
        let index = build_chain_index(storage, Utc::now()).await.unwrap();
        write_json(&config.paths.chain_index_file(), &index)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lists_chains_and_pages_files() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let short_term = Arc::new(FileStorage::new(config.paths.short_term_dir(), 3));
        seed(&config, &short_term).await;
        let host = Arc::new(LocalDatasetHost::new(tmp.path().join("long_term"), "feeds"));
        let access = AccessLayer::new(&config, short_term, host);

        assert_eq!(access.list_chains().await.unwrap(), vec!["SHUFERSAL"]);
        assert_eq!(
            access.list_file_types("shufersal").await.unwrap(),
            vec![FileType::PriceFile]
        );
        assert!(access.list_file_types("VICTORY").await.is_err());

        let (first, next) = access
            .list_files(
                "SHUFERSAL",
                FileType::PriceFile,
                &RecordFilter::default(),
                &PageRequest::first(3),
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        let (rest, next) = access
            .list_files(
                "SHUFERSAL",
                FileType::PriceFile,
                &RecordFilter::default(),
                &next.unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            rest.iter().map(|f| f.file_name.as_str()).collect::<Vec<_>>(),
            vec!["Price-3.xml", "Price-4.xml"]
        );
        assert!(next.is_none());
    }

    struct NullProducer;

    #[async_trait]
    impl MessageProducer for NullProducer {
        async fn ensure_topic(&self, _topic: &str) -> Result<()> {
            Ok(())
        }

        async fn send_batch(
            &self,
            _topic: &str,
            _messages: &[BrokerMessage],
        ) -> Result<Vec<usize>> {
            Ok(Vec::new())
        }

        async fn send(&self, _topic: &str, _message: &BrokerMessage) -> Result<()> {
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Err(AppError::storage("broker", "no brokers reachable"))
        }
    }

    #[tokio::test]
    async fn test_broker_reads_fall_back_to_outputs() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let outputs = FileStorage::new(config.paths.outputs_dir(), 3);
        seed(&config, &outputs).await;
        let host = Arc::new(LocalDatasetHost::new(tmp.path().join("long_term"), "feeds"));
        let broker = Arc::new(BrokerStorage::new(NullProducer, 3));
        let access = AccessLayer::new(&config, broker, host);

        let page = access
            .content(
                "SHUFERSAL",
                FileType::PriceFile,
                &RecordFilter::default(),
                &PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.records.len(), 5);

        let report = access.health().await;
        assert!(!report.process.healthy);
        assert!(!report.short_term.healthy);
        assert!(report.long_term.healthy);
        assert!(!report.is_healthy());
    }
}
