use serde_json::{Map, Value, json};
use tracing::debug;

use super::IngestionRecord;
use crate::{events::DetectedEvent, template::ParsedTemplate};

/// Kind of the event emitted for every accepted record
pub const RECORD_EVENT_KIND: &str = "record";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessorError {
    /// The record cannot be processed; the stream itself is unaffected.
    #[error("{0}")]
    Record(String),
    /// The processor can no longer serve this stream.
    #[error("processor failure: {0}")]
    Fatal(String),
}

impl ProcessorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::Fatal(_))
    }
}

/// Turns one ingested record into zero or more detected events.
///
/// Called with exclusive access to the record's stream, one record at a time.
pub trait SyncProcessor: Send + Sync {
    fn process(
        &self,
        template: &ParsedTemplate,
        record: &IngestionRecord,
    ) -> Result<Vec<DetectedEvent>, ProcessorError>;
}

/// Default processor driven by the template alone.
///
/// Every record must carry all template fields. Each record yields a
/// `record` event holding the projected fields, plus one event per event
/// rule whose numeric field satisfies the rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleProcessor;

impl SyncProcessor for RuleProcessor {
    fn process(
        &self,
        template: &ParsedTemplate,
        record: &IngestionRecord,
    ) -> Result<Vec<DetectedEvent>, ProcessorError> {
        let mut projected = Map::with_capacity(template.fields.len());
        for field in &template.fields {
            let value = record.payload.get(field).ok_or_else(|| {
                ProcessorError::Record(format!("record missing field '{}'", field))
            })?;
            projected.insert(field.clone(), value.clone());
        }

        let mut events = Vec::with_capacity(1 + template.event_rules.len());
        for rule in &template.event_rules {
            let Some(value) = projected.get(&rule.field).and_then(Value::as_f64) else {
                debug!(rule = %rule.name, field = %rule.field, "Field is not numeric, rule skipped");
                continue;
            };
            if rule.op.holds(value, rule.value) {
                events.push(DetectedEvent::new(
                    record.token,
                    rule.name.clone(),
                    json!({
                        "field": rule.field,
                        "value": value,
                        "op": rule.op.symbol(),
                        "threshold": rule.value,
                        "received_at": record.received_at,
                    }),
                ));
            }
        }

        events.insert(
            0,
            DetectedEvent::new(record.token, RECORD_EVENT_KIND, Value::Object(projected)),
        );
        Ok(events)
    }
}
