//! Broker hand-off for asynchronous ingestion.
//!
//! Producers must not block beyond the hand-off itself: a broker applying
//! backpressure reports [`BrokerError::Backpressure`] immediately instead of
//! queueing without bound.

#[cfg(feature = "kafka")]
pub mod kafka;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::{
    coordinator::Coordinator,
    error::{CoordinatorError, CoordinatorResult},
    ingest::leading_token,
};

/// Message handed to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker queue is full")]
    Backpressure,
    #[error("broker connection closed")]
    Disconnected,
    #[error("broker client error: {0}")]
    Client(String),
}

impl From<BrokerError> for CoordinatorError {
    fn from(e: BrokerError) -> Self {
        CoordinatorError::ProducerUnavailable(e.to_string())
    }
}

/// Sink for encoded ingestion payloads.
pub trait BrokerProducer: Send + Sync {
    fn produce(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Encode a raw ingestion payload for the broker.
///
/// The payload must be non-empty JSON; it is re-serialized compactly and must
/// fit in `max_message_bytes`. The stream token is not checked here.
pub fn encode_payload(raw: &str, max_message_bytes: usize) -> CoordinatorResult<Vec<u8>> {
    if raw.trim().is_empty() {
        return Err(CoordinatorError::EncodingFailed(
            "payload is empty".to_string(),
        ));
    }

    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| CoordinatorError::EncodingFailed(format!("payload is not JSON: {}", e)))?;
    let encoded =
        serde_json::to_vec(&value).map_err(|e| CoordinatorError::EncodingFailed(e.to_string()))?;

    if encoded.len() > max_message_bytes {
        return Err(CoordinatorError::EncodingFailed(format!(
            "encoded payload is {} bytes, limit is {}",
            encoded.len(),
            max_message_bytes
        )));
    }
    Ok(encoded)
}

/// In-process broker backed by a bounded crossbeam channel
pub struct InMemoryBroker {
    tx: Sender<BrokerMessage>,
    produced: AtomicU64,
}

impl InMemoryBroker {
    /// Create a broker holding at most `capacity` undelivered messages,
    /// along with the receiving end for a consumer.
    pub fn new(capacity: usize) -> (Arc<Self>, Receiver<BrokerMessage>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Arc::new(Self {
                tx,
                produced: AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Messages accepted so far
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }
}

impl BrokerProducer for InMemoryBroker {
    fn produce(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload,
        };
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::Backpressure,
            TrySendError::Disconnected(_) => BrokerError::Disconnected,
        })?;
        self.produced.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Spawns a dedicated thread draining broker messages into the synchronous
/// ingestion path.
///
/// The token is validated here, at consumption time. Messages that fail are
/// logged and dropped. The thread runs until the channel closes.
pub fn spawn_broker_consumer(
    receiver: Receiver<BrokerMessage>,
    coordinator: Arc<Coordinator>,
    runtime: Handle,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("Broker consumer thread started");
        for message in receiver.iter() {
            let raw = match String::from_utf8(message.payload) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(topic = %message.topic, error = %e, "Dropping non UTF-8 broker message");
                    continue;
                }
            };

            let token = match leading_token(&raw) {
                Ok(token) => token,
                Err(e) => {
                    warn!(topic = %message.topic, error = %e, "Dropping broker message");
                    continue;
                }
            };

            match runtime.block_on(coordinator.process_data_sync(&raw, &token)) {
                Ok(ack) => debug!(token = %token, ?ack, "Consumed broker message"),
                Err(e) => error!(
                    token = %token,
                    code = e.code(),
                    error = %e,
                    "Failed to process broker message"
                ),
            }
        }
        info!("Broker consumer thread stopped");
    })
}
