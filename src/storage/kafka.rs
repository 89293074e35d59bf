//! Kafka message producer (rdkafka).

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use crate::error::{AppError, Result};
use crate::storage::{BrokerMessage, MessageProducer};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaProducer {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaProducer {
    pub fn new(brokers: &str) -> Result<Self> {
        log::debug!("Creating Kafka producer with brokers={brokers:?}");
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000");
        let producer: FutureProducer = config
            .create()
            .map_err(|e| AppError::config(format!("kafka producer: {e}")))?;
        let admin: AdminClient<DefaultClientContext> = config
            .create()
            .map_err(|e| AppError::config(format!("kafka admin client: {e}")))?;
        Ok(Self { producer, admin })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        let new_topic = NewTopic::new(topic, 1, TopicReplication::Fixed(1));
        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(|e| AppError::storage(topic, e))?;
        for result in results {
            match result {
                Ok(name) => log::info!("Created topic {}", name),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => return Err(AppError::storage(name, code)),
            }
        }
        Ok(())
    }

    async fn send_batch(&self, topic: &str, messages: &[BrokerMessage]) -> Result<Vec<usize>> {
        let deliveries = messages.iter().map(|message| self.send(topic, message));
        let results = futures::future::join_all(deliveries).await;
        Ok(results
            .into_iter()
            .enumerate()
            .filter_map(|(i, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    log::debug!("Message {} to {} failed: {}", i, topic, e);
                    Some(i)
                }
            })
            .collect())
    }

    async fn send(&self, topic: &str, message: &BrokerMessage) -> Result<()> {
        let record = FutureRecord::to(topic)
            .key(&message.key)
            .payload(&message.payload);
        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| AppError::storage(topic, e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
                .map(|_| ())
                .map_err(|e| AppError::storage("kafka", e))
        })
        .await
        .map_err(|e| AppError::storage("kafka", e))?
    }
}
