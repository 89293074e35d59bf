//! Short-term storage abstractions for scraped records.
//!
//! Every backend stores [`StorageRecord`]s grouped into named targets
//! (`{file_type}_{chain}`), keyed by the record's natural id. Backends differ
//! in what they can do beyond writing, so optional capabilities have default
//! implementations returning [`AppError::Unsupported`].
//!
//! ```text
//! RecordStorage
//! ├── FileStorage        # JSON lines per target (always built)
//! ├── DocumentStorage<C> # document store, memory or mongo client
//! └── BrokerStorage<P>   # message broker, write-only
//! ```

pub mod broker;
pub mod document;
pub mod file;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mongo")]
pub mod mongo;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Config, Destination, StorageRecord};

// Re-export for convenience
pub use broker::{BrokerMessage, BrokerStorage, MessageProducer, topic_name};
pub use document::{DocumentClient, DocumentStorage, MemoryDocumentClient};
pub use file::FileStorage;

/// Default page size for paginated reads.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Optional constraints on a read.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only records ingested strictly after this instant
    pub ingested_after: Option<DateTime<Utc>>,
    /// Only records ingested at or before this instant
    pub ingested_until: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the file name
    pub file_name_contains: Option<String>,
}

impl RecordFilter {
    pub fn until(cutoff: DateTime<Utc>) -> Self {
        Self {
            ingested_until: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &StorageRecord) -> bool {
        if self.ingested_after.is_some_and(|after| record.ingested_at <= after) {
            return false;
        }
        if self.ingested_until.is_some_and(|until| record.ingested_at > until) {
            return false;
        }
        if let Some(needle) = &self.file_name_contains {
            if !record
                .file_name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Keyset position: the sort key of the last record returned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageCursor {
    pub ingested_at: DateTime<Utc>,
    pub file_name: String,
}

impl PageCursor {
    pub fn after(record: &StorageRecord) -> Self {
        Self {
            ingested_at: record.ingested_at,
            file_name: record.file_name.clone(),
        }
    }

    /// Whether `record` sorts strictly after this cursor.
    pub fn precedes(&self, record: &StorageRecord) -> bool {
        (self.ingested_at, self.file_name.as_str()) < record.sort_key()
    }
}

/// Which slice of the ordered records to return.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub after: Option<PageCursor>,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            after: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn next(&self, cursor: PageCursor) -> Self {
        Self {
            after: Some(cursor),
            limit: self.limit,
        }
    }
}

/// One page of records in `(ingested_at, file_name)` order.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<StorageRecord>,
    /// Cursor for the following page; `None` on the last page
    pub next: Option<PageCursor>,
}

/// A record the backend gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub file_name: String,
    pub message: String,
}

/// Result of a batch write.
#[derive(Debug, Clone, Default)]
pub struct WriteSummary {
    pub written: usize,
    pub failed: Vec<RecordFailure>,
}

impl WriteSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn reject(&mut self, record: &StorageRecord, err: impl std::fmt::Display) {
        self.failed.push(RecordFailure {
            file_name: record.file_name.clone(),
            message: err.to_string(),
        });
    }
}

/// Trait for short-term record backends.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Create the target (collection, topic, file) if missing.
    async fn ensure_target(&self, target: &str) -> Result<()>;

    /// Store records under `target`, overwriting by natural key.
    ///
    /// Malformed records and records that keep failing after the configured
    /// attempts are reported in the summary; the rest of the batch is stored.
    async fn write_records(&self, target: &str, records: &[StorageRecord])
    -> Result<WriteSummary>;

    /// Read records in `(ingested_at, file_name)` order.
    async fn read_records(
        &self,
        target: &str,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page>;

    /// Check the backend is reachable.
    async fn health(&self) -> Result<()>;

    /// Names of every target currently holding data.
    async fn list_targets(&self) -> Result<Vec<String>> {
        Err(AppError::unsupported(self.backend(), "list_targets"))
    }

    /// Delete records ingested at or before `cutoff`, returning how many went.
    async fn purge_until(&self, target: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let _ = (target, cutoff);
        Err(AppError::unsupported(self.backend(), "purge_until"))
    }
}

/// Build the configured short-term backend.
pub async fn open_storage(config: &Config) -> Result<Arc<dyn RecordStorage>> {
    let attempts = config.storage.max_write_attempts;
    match config.storage.destination {
        Destination::File => Ok(Arc::new(FileStorage::new(
            config.paths.short_term_dir(),
            attempts,
        ))),
        #[cfg(feature = "mongo")]
        Destination::Mongo => {
            let client = mongo::MongoDocumentClient::connect(
                &config.storage.mongo_uri,
                &config.storage.mongo_database,
            )
            .await?;
            Ok(Arc::new(DocumentStorage::new(client, attempts)))
        }
        #[cfg(feature = "kafka")]
        Destination::Kafka => {
            let producer = kafka::KafkaProducer::new(&config.storage.kafka_brokers)?;
            Ok(Arc::new(BrokerStorage::new(producer, attempts)))
        }
        #[allow(unreachable_patterns)]
        other => Err(AppError::config(format!(
            "output destination '{other}' is not compiled into this build"
        ))),
    }
}

/// Read every record matching `filter`, following cursors to the end.
pub async fn read_all(
    storage: &dyn RecordStorage,
    target: &str,
    filter: &RecordFilter,
) -> Result<Vec<StorageRecord>> {
    let mut request = PageRequest::default();
    let mut records = Vec::new();
    loop {
        let page = storage.read_records(target, filter, &request).await?;
        records.extend(page.records);
        match page.next {
            Some(cursor) => request = request.next(cursor),
            None => return Ok(records),
        }
    }
}

/// Apply filter, ordering and keyset pagination to an in-memory set.
pub(crate) fn paginate(
    records: impl IntoIterator<Item = StorageRecord>,
    filter: &RecordFilter,
    page: &PageRequest,
) -> Page {
    let mut matching: Vec<StorageRecord> = records
        .into_iter()
        .filter(|r| filter.matches(r))
        .filter(|r| page.after.as_ref().is_none_or(|c| c.precedes(r)))
        .collect();
    matching.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let limit = page.limit.max(1);
    let has_more = matching.len() > limit;
    matching.truncate(limit);
    let next = if has_more {
        matching.last().map(PageCursor::after)
    } else {
        None
    };
    Page {
        records: matching,
        next,
    }
}

/// Run `attempt` until it succeeds or `max_attempts` is reached.
pub(crate) async fn retry<F, Fut>(max_attempts: u32, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last_err = None;
    for n in 1..=max_attempts.max(1) {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::debug!("Attempt {}/{} failed: {}", n, max_attempts, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::validation("no write attempt was made")))
}

/// Validate a batch against its target, rejecting malformed records into `summary`.
pub(crate) fn accept_valid<'a>(
    target: &str,
    records: &'a [StorageRecord],
    summary: &mut WriteSummary,
) -> Vec<&'a StorageRecord> {
    let mut accepted = Vec::with_capacity(records.len());
    for record in records {
        match record.validate_for(target) {
            Ok(()) => accepted.push(record),
            Err(e) => {
                log::warn!("Rejected record {:?} for {}: {}", record.file_name, target, e);
                summary.reject(record, e);
            }
        }
    }
    accepted
}
