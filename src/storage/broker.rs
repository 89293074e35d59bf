//! Message-broker backend.
//!
//! Every record becomes one message on the topic `{file_type}-{chain}`, keyed
//! by its natural id. Brokers keep no queryable state, so reads, listing and
//! purging are unsupported.

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{FileType, StorageRecord, split_target};
use crate::storage::{
    Page, PageRequest, RecordFilter, RecordStorage, WriteSummary, accept_valid, retry,
};

/// Topic a record of `file_type` from `chain` is published to.
pub fn topic_name(file_type: FileType, chain: &str) -> String {
    format!("{}-{}", file_type.as_str(), chain).to_lowercase()
}

/// One outgoing message.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub key: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn from_record(record: &StorageRecord) -> Result<Self> {
        Ok(Self {
            key: record.natural_id().to_string(),
            payload: serde_json::to_vec(record)?,
        })
    }
}

/// Minimal producer surface used by [`BrokerStorage`].
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn ensure_topic(&self, topic: &str) -> Result<()>;

    /// Send a batch; returns the indices of messages that were not delivered.
    async fn send_batch(&self, topic: &str, messages: &[BrokerMessage]) -> Result<Vec<usize>>;

    async fn send(&self, topic: &str, message: &BrokerMessage) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Broker backed record storage.
pub struct BrokerStorage<P> {
    producer: P,
    max_attempts: u32,
}

impl<P: MessageProducer> BrokerStorage<P> {
    pub fn new(producer: P, max_attempts: u32) -> Self {
        Self {
            producer,
            max_attempts,
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    fn topic_for_target(target: &str) -> Result<String> {
        split_target(target)
            .map(|(file_type, chain)| topic_name(file_type, &chain))
            .ok_or_else(|| AppError::validation(format!("'{target}' is not a record target")))
    }
}

#[async_trait]
impl<P: MessageProducer> RecordStorage for BrokerStorage<P> {
    fn backend(&self) -> &'static str {
        "broker"
    }

    async fn ensure_target(&self, target: &str) -> Result<()> {
        let topic = Self::topic_for_target(target)?;
        self.producer.ensure_topic(&topic).await
    }

    async fn write_records(
        &self,
        target: &str,
        records: &[StorageRecord],
    ) -> Result<WriteSummary> {
        let topic = Self::topic_for_target(target)?;
        let mut summary = WriteSummary::default();

        let mut batch = Vec::new();
        let mut batch_records = Vec::new();
        for record in accept_valid(target, records, &mut summary) {
            match BrokerMessage::from_record(record) {
                Ok(message) => {
                    batch.push(message);
                    batch_records.push(record);
                }
                Err(e) => summary.reject(record, e),
            }
        }
        if batch.is_empty() {
            return Ok(summary);
        }

        let failed = match self.producer.send_batch(&topic, &batch).await {
            Ok(failed) => failed,
            Err(e) => {
                log::warn!("Batch send to {} failed: {}", topic, e);
                (0..batch.len()).collect()
            }
        };
        summary.written = batch.len() - failed.len();

        let remaining_attempts = self.max_attempts.saturating_sub(1);
        for index in failed {
            let (Some(message), Some(record)) = (batch.get(index), batch_records.get(index)) else {
                continue;
            };
            let outcome = if remaining_attempts == 0 {
                Err(AppError::storage(target, "batch send failed"))
            } else {
                retry(remaining_attempts, || self.producer.send(&topic, message)).await
            };
            match outcome {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    log::error!("Dropping {} from {}: {}", record.file_name, topic, e);
                    summary.reject(record, e);
                }
            }
        }
        Ok(summary)
    }

    async fn read_records(
        &self,
        _target: &str,
        _filter: &RecordFilter,
        _page: &PageRequest,
    ) -> Result<Page> {
        Err(AppError::unsupported(self.backend(), "read_records"))
    }

    async fn health(&self) -> Result<()> {
        self.producer.ping().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    /// Records sends; `flaky` keys fail that many times.
    #[derive(Default)]
    struct FakeProducer {
        sent: Mutex<Vec<(String, String)>>,
        flaky: Mutex<HashMap<String, u32>>,
    }

    impl FakeProducer {
        fn deliver(&self, topic: &str, message: &BrokerMessage) -> bool {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&message.key) {
                if *left > 0 {
                    *left -= 1;
                    return false;
                }
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), message.key.clone()));
            true
        }
    }

    #[async_trait]
    impl MessageProducer for FakeProducer {
        async fn ensure_topic(&self, _topic: &str) -> Result<()> {
            Ok(())
        }

        async fn send_batch(&self, topic: &str, messages: &[BrokerMessage]) -> Result<Vec<usize>> {
            Ok(messages
                .iter()
                .enumerate()
                .filter(|(_, m)| !self.deliver(topic, m))
                .map(|(i, _)| i)
                .collect())
        }

        async fn send(&self, topic: &str, message: &BrokerMessage) -> Result<()> {
            if self.deliver(topic, message) {
                Ok(())
            } else {
                Err(AppError::storage(topic, "broker unavailable"))
            }
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn record(name: &str) -> StorageRecord {
        StorageRecord::new("RAMI_LEVY", FileType::PriceFullFile, name, "<x/>", Utc::now())
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(
            topic_name(FileType::PriceFullFile, "RAMI_LEVY"),
            "price_full_file-rami_levy"
        );
    }

    #[tokio::test]
    async fn test_failed_messages_resent_individually() {
        let producer = FakeProducer::default();
        producer.flaky.lock().unwrap().insert("b.xml".into(), 1);
        let storage = BrokerStorage::new(producer, 3);

        let summary = storage
            .write_records(
                "price_full_file_rami_levy",
                &[record("a.xml"), record("b.xml")],
            )
            .await
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.written, 2);
        let sent = storage.producer().sent.lock().unwrap().clone();
        assert!(sent.iter().all(|(topic, _)| topic == "price_full_file-rami_levy"));
    }

    #[tokio::test]
    async fn test_persistent_failure_dropped() {
        let producer = FakeProducer::default();
        producer.flaky.lock().unwrap().insert("b.xml".into(), 99);
        let storage = BrokerStorage::new(producer, 3);

        let summary = storage
            .write_records(
                "price_full_file_rami_levy",
                &[record("a.xml"), record("b.xml")],
            )
            .await
            .unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.failed[0].file_name, "b.xml");
    }

    #[tokio::test]
    async fn test_reads_unsupported() {
        let storage = BrokerStorage::new(FakeProducer::default(), 3);
        let err = storage
            .read_records(
                "price_full_file_rami_levy",
                &RecordFilter::default(),
                &PageRequest::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(storage.list_targets().await.unwrap_err().is_unsupported());
    }
}
