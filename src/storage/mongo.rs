//! MongoDB document client.
//!
//! Documents carry `_id` = natural id and `ingested_ns` (nanoseconds since
//! the epoch) so ordering and cutoff queries run server-side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Document, doc};
use mongodb::{Client, Collection, Database};

use crate::error::{AppError, Result};
use crate::models::StorageRecord;
use crate::storage::document::upsert_each;
use crate::storage::{DocumentClient, Page, PageCursor, PageRequest, RecordFilter};

/// Replace-one upserts in flight per batch.
const UPSERT_CONCURRENCY: usize = 16;

pub struct MongoDocumentClient {
    database: Database,
}

impl MongoDocumentClient {
    /// Connect and select the database.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| AppError::config(format!("invalid mongo uri: {e}")))?;
        log::info!("Connected to mongo database '{}'", database);
        Ok(Self {
            database: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    fn to_document(record: &StorageRecord) -> Result<Document> {
        let mut document = bson::to_document(record)
            .map_err(|e| AppError::storage(record.target(), e))?;
        document.insert("_id", record.natural_id());
        document.insert("ingested_ns", nanos(record.ingested_at));
        Ok(document)
    }

    fn query(filter: &RecordFilter, after: Option<&PageCursor>) -> Document {
        let mut clauses = Vec::new();
        if let Some(after) = filter.ingested_after {
            clauses.push(doc! { "ingested_ns": { "$gt": nanos(after) } });
        }
        if let Some(until) = filter.ingested_until {
            clauses.push(doc! { "ingested_ns": { "$lte": nanos(until) } });
        }
        if let Some(needle) = &filter.file_name_contains {
            clauses.push(doc! {
                "file_name": { "$regex": regex::escape(needle), "$options": "i" }
            });
        }
        if let Some(cursor) = after {
            let ns = nanos(cursor.ingested_at);
            clauses.push(doc! {
                "$or": [
                    { "ingested_ns": { "$gt": ns } },
                    { "ingested_ns": ns, "file_name": { "$gt": cursor.file_name.as_str() } },
                ]
            });
        }
        if clauses.is_empty() {
            Document::new()
        } else {
            doc! { "$and": clauses }
        }
    }
}

fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1000))
}

#[async_trait]
impl DocumentClient for MongoDocumentClient {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let existing = self
            .database
            .list_collection_names()
            .await
            .map_err(|e| AppError::storage(collection, e))?;
        if !existing.iter().any(|name| name == collection) {
            self.database
                .create_collection(collection)
                .await
                .map_err(|e| AppError::storage(collection, e))?;
            log::info!("Created collection {}", collection);
        }
        Ok(())
    }

    async fn upsert_many(
        &self,
        collection: &str,
        records: &[&StorageRecord],
    ) -> Result<Vec<String>> {
        let failed = upsert_each(records, UPSERT_CONCURRENCY, |record| {
            self.upsert_one(collection, record)
        })
        .await;
        if !failed.is_empty() {
            log::warn!(
                "{} of {} upserts into {} failed",
                failed.len(),
                records.len(),
                collection
            );
        }
        Ok(failed)
    }

    async fn upsert_one(&self, collection: &str, record: &StorageRecord) -> Result<()> {
        let document = Self::to_document(record)?;
        self.collection(collection)
            .replace_one(doc! { "_id": record.natural_id() }, document)
            .upsert(true)
            .await
            .map_err(|e| AppError::storage(collection, e))?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &RecordFilter,
        page: &PageRequest,
    ) -> Result<Page> {
        let limit = page.limit.max(1);
        let cursor = self
            .collection(collection)
            .find(Self::query(filter, page.after.as_ref()))
            .sort(doc! { "ingested_ns": 1, "file_name": 1 })
            // One extra row tells us whether another page exists.
            .limit(limit as i64 + 1)
            .await
            .map_err(|e| AppError::storage(collection, e))?;
        let documents: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| AppError::storage(collection, e))?;

        let mut records = documents
            .into_iter()
            .map(|d| {
                bson::from_document::<StorageRecord>(d)
                    .map_err(|e| AppError::storage(collection, e))
            })
            .collect::<Result<Vec<_>>>()?;
        let has_more = records.len() > limit;
        records.truncate(limit);
        let next = if has_more {
            records.last().map(PageCursor::after)
        } else {
            None
        };
        Ok(Page { records, next })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = self
            .database
            .list_collection_names()
            .await
            .map_err(|e| AppError::storage(self.database.name(), e))?;
        names.sort();
        Ok(names)
    }

    async fn delete_until(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = self
            .collection(collection)
            .delete_many(doc! { "ingested_ns": { "$lte": nanos(cutoff) } })
            .await
            .map_err(|e| AppError::storage(collection, e))?;
        Ok(result.deleted_count as usize)
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| AppError::storage(self.database.name(), e))?;
        Ok(())
    }
}
