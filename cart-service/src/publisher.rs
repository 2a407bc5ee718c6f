use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::PublishError;

/// Broker contract: at-least-once, ordered per key.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Waits for in-flight messages to be delivered.
    async fn flush(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Creates the producer and fetches cluster metadata so an unreachable
    /// broker fails here instead of on the first publish. Blocks the
    /// calling thread for at most `timeout`.
    pub fn connect(brokers: &str, timeout: Duration) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("socket.timeout.ms", timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| PublishError::Broker(format!("failed to create producer: {}", e)))?;

        let metadata = producer
            .client()
            .fetch_metadata(None, Timeout::After(timeout))
            .map_err(|e| PublishError::Broker(format!("broker {} unreachable: {}", brokers, e)))?;
        info!(brokers = %brokers, topics = metadata.topics().len(), "Connected to Kafka");

        Ok(Self { producer, timeout })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        let delivery = self.producer.send(record, Timeout::After(self.timeout));

        let (partition, offset) = tokio::time::timeout(self.timeout, delivery)
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?
            .map_err(|(e, _)| PublishError::Broker(e.to_string()))?;

        debug!(topic, key, partition, offset, "Published event");
        Ok(())
    }

    async fn flush(&self) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| PublishError::Broker(format!("flush task failed: {}", e)))?
            .map_err(|e| PublishError::Broker(format!("flush failed: {}", e)))
    }
}
