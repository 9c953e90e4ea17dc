//! Stream tokens and the registry that owns their definitions.
//!
//! Each definition sits behind its own FIFO async mutex, so mutations of one
//! stream are serialized in arrival order while distinct streams proceed in
//! parallel. The map itself is only locked for lookups and inserts.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{CoordinatorError, CoordinatorResult},
    template::ParsedTemplate,
};

/// Opaque identifier of one logical data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamToken(Uuid);

impl StreamToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for StreamToken {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| CoordinatorError::UnknownToken(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    Pending,
    Active,
    Failed,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamStatus::Pending => "PENDING",
            StreamStatus::Active => "ACTIVE",
            StreamStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Where a stream's data originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Kafka,
}

impl FromStr for SourceKind {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SourceKind::File),
            "kafka" => Ok(SourceKind::Kafka),
            other => Err(CoordinatorError::MalformedData(format!(
                "unknown source kind '{}', expected 'file' or 'kafka'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub kind: SourceKind,
    pub topic: Option<String>,
}

/// Everything the coordinator knows about one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub token: StreamToken,
    pub template: ParsedTemplate,
    pub created_at: DateTime<Utc>,
    pub status: StreamStatus,
    pub source: Option<DataSource>,
    /// Records successfully processed through the synchronous path.
    pub ingested: u64,
}

impl StreamDefinition {
    fn new(token: StreamToken, template: ParsedTemplate) -> Self {
        Self {
            token,
            template,
            created_at: Utc::now(),
            status: StreamStatus::Pending,
            source: None,
            ingested: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StreamStatus::Active
    }

    /// Error to report when this stream refuses data, if it does.
    pub fn ensure_active(&self) -> CoordinatorResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoordinatorError::StreamInactive {
                token: self.token,
                status: self.status,
            })
        }
    }
}

struct Slot {
    /// Serializes mutations; tokio's mutex grants the lock in FIFO order.
    gate: Arc<tokio::sync::Mutex<()>>,
    definition: Arc<RwLock<StreamDefinition>>,
    created_at: DateTime<Utc>,
}

impl Slot {
    /// A deadline past the representable range never expires.
    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        ttl.and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .is_some_and(|deadline| now >= deadline)
    }
}

/// Owner of every issued token and its definition.
pub struct TokenRegistry {
    streams: RwLock<HashMap<StreamToken, Arc<Slot>>>,
    ttl: Option<Duration>,
}

impl TokenRegistry {
    /// Registry whose definitions live for the whole process.
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            ttl: None,
        }
    }

    /// Registry evicting definitions older than `ttl_seconds`.
    ///
    /// A TTL too large for a [`Duration`] behaves like no TTL at all.
    pub fn with_ttl(ttl_seconds: Option<u64>) -> Self {
        let ttl = ttl_seconds
            .and_then(|s| i64::try_from(s).ok())
            .and_then(Duration::try_seconds);
        Self {
            streams: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a token for an already validated template.
    ///
    /// The definition is inserted and activated under one write lock, so no
    /// reader ever sees it PENDING.
    pub fn create(&self, template: ParsedTemplate) -> StreamToken {
        let mut streams = self.streams.write();

        let mut token = StreamToken::generate();
        while streams.contains_key(&token) {
            token = StreamToken::generate();
        }

        let mut definition = StreamDefinition::new(token, template);
        definition.status = StreamStatus::Active;
        let created_at = definition.created_at;

        streams.insert(
            token,
            Arc::new(Slot {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                definition: Arc::new(RwLock::new(definition)),
                created_at,
            }),
        );

        info!(token = %token, "Issued stream token");
        token
    }

    /// Snapshot of the definition for `token`.
    pub fn get(&self, token: &StreamToken) -> CoordinatorResult<StreamDefinition> {
        let slot = self.slot(token)?;
        let definition = slot.definition.read().clone();
        Ok(definition)
    }

    pub fn contains(&self, token: &StreamToken) -> bool {
        self.slot(token).is_ok()
    }

    /// Run `f` with exclusive access to the definition for `token`.
    ///
    /// Callers on the same token are admitted one at a time in the order
    /// they reached the lock. `f` runs on the blocking pool against a working
    /// copy that is committed when `f` returns; if `f` panics nothing is
    /// committed and the lock is still released. Once the lock is acquired
    /// the section runs to completion even if the calling future is dropped.
    pub async fn with_exclusive<F, R>(&self, token: &StreamToken, f: F) -> CoordinatorResult<R>
    where
        F: FnOnce(&mut StreamDefinition) -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = self.slot(token)?;
        let guard = slot.gate.clone().lock_owned().await;
        let definition = slot.definition.clone();
        debug!(token = %token, "Acquired exclusive stream access");

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut working = definition.read().clone();
            let result = f(&mut working);
            *definition.write() = working;
            result
        })
        .await
        .map_err(|e| CoordinatorError::ProcessingFailed {
            processed: 0,
            total: 0,
            reason: format!("exclusive section for {} aborted: {}", token, e),
        })
    }

    /// Number of live definitions.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.streams
            .read()
            .values()
            .filter(|slot| !slot.is_expired(self.ttl, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens(&self) -> Vec<StreamToken> {
        let now = Utc::now();
        self.streams
            .read()
            .iter()
            .filter(|(_, slot)| !slot.is_expired(self.ttl, now))
            .map(|(token, _)| *token)
            .collect()
    }

    /// Drop every expired definition, returning the tokens removed.
    ///
    /// Expired definitions are already invisible to lookups; they stay in
    /// the map until this sweep so callers holding per-token state learn
    /// which streams are gone.
    pub fn purge_expired(&self) -> Vec<StreamToken> {
        if self.ttl.is_none() {
            return Vec::new();
        }
        let now = Utc::now();
        let mut streams = self.streams.write();
        let expired: Vec<StreamToken> = streams
            .iter()
            .filter(|(_, slot)| slot.is_expired(self.ttl, now))
            .map(|(token, _)| *token)
            .collect();
        for token in &expired {
            streams.remove(token);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Purged expired stream definitions");
        }
        expired
    }

    fn slot(&self, token: &StreamToken) -> CoordinatorResult<Arc<Slot>> {
        let now = Utc::now();
        match self.streams.read().get(token) {
            Some(slot) if !slot.is_expired(self.ttl, now) => Ok(slot.clone()),
            Some(_) => {
                debug!(token = %token, "Stream definition expired");
                Err(CoordinatorError::UnknownToken(token.to_string()))
            }
            None => Err(CoordinatorError::UnknownToken(token.to_string())),
        }
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}
