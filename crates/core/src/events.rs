use std::{
    collections::{HashMap, VecDeque},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{CoordinatorError, CoordinatorResult},
    ingest::TOKEN_FIELD,
    token::StreamToken,
};

/// Default number of events retained per stream
pub const DEFAULT_EVENT_RETENTION: usize = 1000;

/// Event kind used for externally pushed events that do not name one
pub const EXTERNAL_EVENT_KIND: &str = "external";

/// A derived artifact produced from ingested data
///
/// Events pushed from outside without a stream token are global: they reach
/// every listener but are not kept in any stream's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEvent {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<StreamToken>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

impl DetectedEvent {
    pub fn new(token: StreamToken, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::build(Some(token), kind, payload)
    }

    /// An event not bound to any stream.
    pub fn global(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::build(None, kind, payload)
    }

    fn build(
        token: Option<StreamToken>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            kind: kind.into(),
            payload,
            detected_at: Utc::now(),
        }
    }

    /// Build an event from a JSON document pushed by an out-of-band detector.
    ///
    /// Any JSON document is accepted. Without a `stream_token` field the
    /// event is global; a token that is present must parse. `kind` is
    /// optional.
    pub fn from_inbound(document: serde_json::Value) -> CoordinatorResult<Self> {
        let token = match document.get(TOKEN_FIELD) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(raw)) => Some(
                raw.parse::<StreamToken>()
                    .map_err(|e| CoordinatorError::MalformedData(e.to_string()))?,
            ),
            Some(other) => {
                return Err(CoordinatorError::MalformedData(format!(
                    "'{}' must be a string, got {}",
                    TOKEN_FIELD, other
                )));
            }
        };

        let kind = document
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or(EXTERNAL_EVENT_KIND)
            .to_string();

        Ok(Self::build(token, kind, document))
    }
}

/// Time window of a history query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    All,
}

impl FromStr for TimeRange {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALL" => Ok(TimeRange::All),
            other => Err(CoordinatorError::RangeUnsupported(other.to_string())),
        }
    }
}

/// Persistence for detected events, queried by the read path
pub trait EventStore: Send + Sync {
    /// Record `event` in its stream's history. Global events are ignored.
    fn append(&self, event: DetectedEvent);

    /// Retained events for `token`, oldest first
    fn history(&self, token: &StreamToken) -> Vec<DetectedEvent>;

    /// Forget the history of `token`, returning how many events were dropped
    fn remove(&self, token: &StreamToken) -> usize;
}

/// Bounded in-memory event history, one deque per stream
pub struct InMemoryEventStore {
    events: RwLock<HashMap<StreamToken, VecDeque<DetectedEvent>>>,
    max_events: usize,
}

impl InMemoryEventStore {
    /// Create a store keeping at most `max_events` per stream
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            max_events: max_events.max(1),
        }
    }

    /// Total events retained across all streams
    pub fn len(&self) -> usize {
        self.events.read().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_RETENTION)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: DetectedEvent) {
        let Some(token) = event.token else {
            return;
        };
        let mut events = self.events.write();
        let history = events
            .entry(token)
            .or_insert_with(|| VecDeque::with_capacity(self.max_events.min(64)));
        if history.len() >= self.max_events {
            history.pop_front();
        }
        history.push_back(event);
    }

    fn history(&self, token: &StreamToken) -> Vec<DetectedEvent> {
        self.events
            .read()
            .get(token)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove(&self, token: &StreamToken) -> usize {
        self.events
            .write()
            .remove(token)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}
