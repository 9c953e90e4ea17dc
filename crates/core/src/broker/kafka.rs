use rdkafka::{
    config::ClientConfig,
    error::KafkaError,
    producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer},
    types::RDKafkaErrorCode,
};
use tracing::{info, warn};

use super::{BrokerError, BrokerProducer};

/// Kafka producer that only enqueues into librdkafka's local queue.
///
/// Delivery to the cluster happens on librdkafka's background thread; a full
/// local queue is reported as backpressure.
pub struct KafkaProducer {
    producer: ThreadedProducer<DefaultProducerContext>,
}

impl KafkaProducer {
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        let producer: ThreadedProducer<DefaultProducerContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BrokerError::Client(e.to_string()))?;
        info!(brokers = %brokers, "Connected Kafka producer");
        Ok(Self { producer })
    }
}

impl BrokerProducer for KafkaProducer {
    fn produce(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let record: BaseRecord<'_, (), Vec<u8>> = BaseRecord::to(topic).payload(&payload);
        self.producer.send(record).map_err(|(e, _)| match e {
            KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => BrokerError::Backpressure,
            other => {
                warn!(topic = %topic, error = %other, "Kafka produce failed");
                BrokerError::Client(other.to_string())
            }
        })
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        let _ = self.producer.flush(std::time::Duration::from_secs(5));
    }
}
