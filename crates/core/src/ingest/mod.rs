//! Ingestion routing: synchronous processing or broker hand-off.

pub mod processor;

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub use processor::{ProcessorError, RECORD_EVENT_KIND, RuleProcessor, SyncProcessor};

use crate::{
    broker::{BrokerProducer, encode_payload},
    error::{CoordinatorError, CoordinatorResult},
    events::{DetectedEvent, EventStore},
    notifier::EventNotifier,
    template::ParsedTemplate,
    token::{StreamStatus, StreamToken, TokenRegistry},
};

/// Record field naming the stream a record belongs to
pub const TOKEN_FIELD: &str = "stream_token";

/// One record of a load request, bound to its stream
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionRecord {
    pub token: StreamToken,
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

/// Outcome of an accepted ingestion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum Ack {
    /// Every record was processed in the request.
    Processed { records: usize, events: usize },
    /// The payload was accepted by the broker; processing happens later.
    Queued { topic: String, bytes: usize },
}

/// Token of the first record of a raw batch, the one a load request targets.
pub fn leading_token(raw: &str) -> CoordinatorResult<StreamToken> {
    let batch = parse_array(raw)?;
    let first = batch
        .first()
        .ok_or_else(|| CoordinatorError::MalformedData("batch is empty".to_string()))?;
    let token = first
        .get(TOKEN_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CoordinatorError::MalformedData(format!("record 0 has no '{}' field", TOKEN_FIELD))
        })?;
    token.parse()
}

fn parse_array(raw: &str) -> CoordinatorResult<Vec<Value>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| CoordinatorError::MalformedData(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(CoordinatorError::MalformedData(
            "data must be a JSON array of records".to_string(),
        )),
    }
}

/// Parse a raw batch whose records must all belong to `token`.
///
/// Either every record is accepted or the batch is rejected as a whole.
pub fn parse_batch(token: &StreamToken, raw: &str) -> CoordinatorResult<Vec<IngestionRecord>> {
    let items = parse_array(raw)?;
    if items.is_empty() {
        return Err(CoordinatorError::MalformedData("batch is empty".to_string()));
    }

    let received_at = Utc::now();
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let Value::Object(payload) = item else {
                return Err(CoordinatorError::MalformedData(format!(
                    "record {} is not a JSON object",
                    index
                )));
            };

            let record_token = payload
                .get(TOKEN_FIELD)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CoordinatorError::MalformedData(format!(
                        "record {} has no '{}' field",
                        index, TOKEN_FIELD
                    ))
                })?;

            if record_token.parse::<StreamToken>().ok().as_ref() != Some(token) {
                return Err(CoordinatorError::MalformedData(format!(
                    "record {} belongs to stream '{}', not {}",
                    index, record_token, token
                )));
            }

            Ok(IngestionRecord {
                token: *token,
                payload,
                received_at,
            })
        })
        .collect()
}

/// Run `processor` on one record, turning a panic into a fatal error.
fn process_record(
    processor: &dyn SyncProcessor,
    template: &ParsedTemplate,
    record: &IngestionRecord,
) -> Result<Vec<DetectedEvent>, ProcessorError> {
    panic::catch_unwind(AssertUnwindSafe(|| processor.process(template, record))).unwrap_or_else(
        |payload| {
            Err(ProcessorError::Fatal(format!(
                "processor panicked: {}",
                panic_message(payload.as_ref())
            )))
        },
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Dispatches load requests to the synchronous processor or the broker.
pub struct IngestionRouter {
    registry: Arc<TokenRegistry>,
    processor: Arc<dyn SyncProcessor>,
    producer: Arc<dyn BrokerProducer>,
    events: Arc<dyn EventStore>,
    notifier: Arc<EventNotifier>,
    topic: String,
    max_message_bytes: usize,
}

impl IngestionRouter {
    pub fn new(
        registry: Arc<TokenRegistry>,
        processor: Arc<dyn SyncProcessor>,
        producer: Arc<dyn BrokerProducer>,
        events: Arc<dyn EventStore>,
        notifier: Arc<EventNotifier>,
        topic: impl Into<String>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            registry,
            processor,
            producer,
            events,
            notifier,
            topic: topic.into(),
            max_message_bytes,
        }
    }

    /// Process a batch for `token` within the request.
    ///
    /// The token and every record are checked before anything is processed.
    /// Records are then processed in order under the token's exclusive scope;
    /// the first failure stops the batch without undoing earlier records. A
    /// processor panic counts as a fatal failure of the record it hit.
    pub async fn route_sync(&self, token: &StreamToken, raw_data: &str) -> CoordinatorResult<Ack> {
        self.registry.get(token)?.ensure_active()?;
        let records = parse_batch(token, raw_data)?;
        let total = records.len();
        debug!(token = %token, records = total, "Accepted batch for synchronous processing");

        let processor = self.processor.clone();
        let events = self.events.clone();
        let notifier = self.notifier.clone();

        let outcome = self
            .registry
            .with_exclusive(token, move |definition| {
                // Status may have changed while we waited for the lock.
                definition.ensure_active()?;

                let mut emitted = 0;
                for (processed, record) in records.iter().enumerate() {
                    let detected = process_record(processor.as_ref(), &definition.template, record)
                        .map_err(|e| {
                            if e.is_fatal() {
                                definition.status = StreamStatus::Failed;
                            }
                            CoordinatorError::ProcessingFailed {
                                processed,
                                total,
                                reason: e.to_string(),
                            }
                        })?;

                    for event in detected {
                        events.append(event.clone());
                        notifier.publish(&event);
                        emitted += 1;
                    }
                    definition.ingested += 1;
                }

                Ok(Ack::Processed {
                    records: total,
                    events: emitted,
                })
            })
            .await?;

        match &outcome {
            Ok(ack) => info!(token = %token, ?ack, "Processed batch"),
            Err(e) => warn!(token = %token, error = %e, "Batch processing stopped"),
        }
        outcome
    }

    /// Hand a raw payload to the broker without validating its token.
    pub fn route_async(&self, raw: &str) -> CoordinatorResult<Ack> {
        let payload = encode_payload(raw, self.max_message_bytes)?;
        let bytes = payload.len();
        self.producer.produce(&self.topic, payload)?;
        debug!(topic = %self.topic, bytes, "Handed payload to broker");
        Ok(Ack::Queued {
            topic: self.topic.clone(),
            bytes,
        })
    }
}
