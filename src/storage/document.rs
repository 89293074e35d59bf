//! Document-store backend.
//!
//! Each target is a collection; documents are keyed by the record's natural
//! id. Writes go out as one batched upsert, and ids the batch could not store
//! are retried one by one.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::error::{AppError, Result};
use crate::models::StorageRecord;
use crate::storage::{
    Page, PageRequest, RecordFilter, RecordStorage, WriteSummary, accept_valid, paginate, retry,
};

/// Minimal document database surface used by [`DocumentStorage`].
#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// Upsert many documents; returns the natural ids that were not stored.
    async fn upsert_many(&self, collection: &str, records: &[&StorageRecord])
    -> Result<Vec<String>>;

    async fn upsert_one(&self, collection: &str, record: &StorageRecord) -> Result<()>;

    async fn find(
        &self,
        collection: &str,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn delete_until(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn ping(&self) -> Result<()>;
}

/// Document-store backed record storage.
pub struct DocumentStorage<C> {
    client: C,
    max_attempts: u32,
}

impl<C: DocumentClient> DocumentStorage<C> {
    pub fn new(client: C, max_attempts: u32) -> Self {
        Self {
            client,
            max_attempts,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: DocumentClient> RecordStorage for DocumentStorage<C> {
    fn backend(&self) -> &'static str {
        "document"
    }

    async fn ensure_target(&self, target: &str) -> Result<()> {
        self.client.ensure_collection(target).await
    }

    async fn write_records(
        &self,
        target: &str,
        records: &[StorageRecord],
    ) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        let accepted = accept_valid(target, records, &mut summary);
        if accepted.is_empty() {
            return Ok(summary);
        }

        // First attempt: the whole batch at once.
        let failed_ids = match self.client.upsert_many(target, &accepted).await {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Batch upsert into {} failed: {}", target, e);
                accepted.iter().map(|r| r.natural_id().to_string()).collect()
            }
        };
        summary.written = accepted.len() - failed_ids.len();
        if failed_ids.is_empty() {
            return Ok(summary);
        }

        log::info!(
            "Retrying {} documents individually in {}",
            failed_ids.len(),
            target
        );
        let remaining_attempts = self.max_attempts.saturating_sub(1);
        for record in accepted
            .iter()
            .filter(|r| failed_ids.iter().any(|id| id == r.natural_id()))
        {
            let outcome = if remaining_attempts == 0 {
                Err(AppError::storage(target, "batch upsert failed"))
            } else {
                retry(remaining_attempts, || self.client.upsert_one(target, record)).await
            };
            match outcome {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    log::error!(
                        "Dropping {} from {} after {} attempts: {}",
                        record.file_name,
                        target,
                        self.max_attempts,
                        e
                    );
                    summary.reject(record, e);
                }
            }
        }
        Ok(summary)
    }

    async fn read_records(
        &self,
        target: &str,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page> {
        self.client.find(target, filter, page).await
    }

    async fn health(&self) -> Result<()> {
        self.client.ping().await
    }

    async fn list_targets(&self) -> Result<Vec<String>> {
        self.client.list_collections().await
    }

    async fn purge_until(&self, target: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        self.client.delete_until(target, cutoff).await
    }
}

/// Upsert every record on its own, at most `concurrency` in flight.
///
/// Returns the natural ids whose write failed. Each write replaces a single
/// document, so a failure never removes what was stored before.
pub async fn upsert_each<'a, F, Fut>(
    records: &[&'a StorageRecord],
    concurrency: usize,
    write: F,
) -> Vec<String>
where
    F: Fn(&'a StorageRecord) -> Fut,
    F: Send + 'a,
    Fut: Future<Output = Result<()>> + Send + 'a,
{
    let pending: futures::stream::BoxStream<'a, _> =
        Box::pin(stream::iter(records.to_vec()).map(move |record| {
            let pending = write(record);
            async move { (record.natural_id(), pending.await) }
        }));
    let outcomes: Vec<(&str, Result<()>)> = pending
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    outcomes
        .into_iter()
        .filter_map(|(id, outcome)| match outcome {
            Ok(()) => None,
            Err(e) => {
                log::debug!("Upsert of {} failed: {}", id, e);
                Some(id.to_string())
            }
        })
        .collect()
}

type Collections = HashMap<String, BTreeMap<String, StorageRecord>>;

/// In-process document client, for tests and dry runs.
#[derive(Default)]
pub struct MemoryDocumentClient {
    collections: Mutex<Collections>,
    /// Natural id -> remaining forced failures
    flaky: Mutex<HashMap<String, u32>>,
}

impl MemoryDocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `failures` writes of `file_name` fail.
    pub fn fail_next(&self, file_name: &str, failures: u32) {
        self.flaky_map().insert(file_name.to_string(), failures);
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections_map()
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn collections_map(&self) -> std::sync::MutexGuard<'_, Collections> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flaky_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.flaky
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn should_fail(&self, id: &str) -> bool {
        let mut flaky = self.flaky_map();
        match flaky.get_mut(id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl DocumentClient for MemoryDocumentClient {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        self.collections_map()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert_many(
        &self,
        collection: &str,
        records: &[&StorageRecord],
    ) -> Result<Vec<String>> {
        let failed = upsert_each(records, records.len(), |record| {
            self.upsert_one(collection, record)
        })
        .await;
        Ok(failed)
    }

    async fn upsert_one(&self, collection: &str, record: &StorageRecord) -> Result<()> {
        if self.should_fail(record.natural_id()) {
            return Err(AppError::storage(collection, "injected write failure"));
        }
        self.collections_map()
            .entry(collection.to_string())
            .or_default()
            .insert(record.natural_id().to_string(), record.clone());
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page> {
        let records: Vec<StorageRecord> = self
            .collections_map()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        Ok(paginate(records, filter, page))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections_map().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_until(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut collections = self.collections_map();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, r| r.ingested_at > cutoff);
        Ok(before - docs.len())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;
    use crate::storage::read_all;

    const TARGET: &str = "promo_file_victory";

    fn record(name: &str) -> StorageRecord {
        StorageRecord::new("VICTORY", FileType::PromoFile, name, "<p/>", Utc::now())
    }

    #[tokio::test]
    async fn test_partial_batch_failure_isolated() {
        let client = MemoryDocumentClient::new();
        // Fails in the batch and on every individual retry.
        client.fail_next("Promo2.xml", 10);
        let storage = DocumentStorage::new(client, 3);

        let summary = storage
            .write_records(
                TARGET,
                &[record("Promo1.xml"), record("Promo2.xml"), record("Promo3.xml")],
            )
            .await
            .unwrap();

        assert_eq!(summary.written, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].file_name, "Promo2.xml");
        assert_eq!(storage.client().len(TARGET), 2);
    }

    #[tokio::test]
    async fn test_batch_failure_recovered_by_individual_retry() {
        let client = MemoryDocumentClient::new();
        client.fail_next("Promo1.xml", 2);
        let storage = DocumentStorage::new(client, 3);

        let summary = storage
            .write_records(TARGET, &[record("Promo1.xml")])
            .await
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.written, 1);
    }

    #[tokio::test]
    async fn test_failed_upsert_keeps_stored_document() {
        let stored = Mutex::new(BTreeMap::from([(
            "Promo2.xml".to_string(),
            "old".to_string(),
        )]));
        let fresh = [record("Promo1.xml"), record("Promo2.xml")];
        let batch: Vec<&StorageRecord> = fresh.iter().collect();

        let failed = upsert_each(&batch, 4, |record| {
            let stored = &stored;
            async move {
                if record.file_name == "Promo2.xml" {
                    return Err(AppError::storage(TARGET, "connection reset"));
                }
                let mut docs = stored.lock().unwrap();
                docs.insert(record.natural_id().to_string(), record.content.clone());
                Ok(())
            }
        })
        .await;

        assert_eq!(failed, vec!["Promo2.xml".to_string()]);
        let docs = stored.lock().unwrap();
        assert_eq!(docs.get("Promo2.xml").map(String::as_str), Some("old"));
        assert_eq!(docs.get("Promo1.xml").map(String::as_str), Some("<p/>"));
    }

    #[tokio::test]
    async fn test_overwrite_and_purge() {
        let storage = DocumentStorage::new(MemoryDocumentClient::new(), 3);
        let mut first = record("Promo1.xml");
        first.content = "old".into();
        storage.write_records(TARGET, &[first]).await.unwrap();
        let mut second = record("Promo1.xml");
        second.content = "new".into();
        storage.write_records(TARGET, &[second]).await.unwrap();

        let all = read_all(&storage, TARGET, &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "new");

        let purged = storage.purge_until(TARGET, Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(storage.list_targets().await.unwrap(), vec![TARGET]);
    }
}
