use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    broker::BrokerProducer,
    config::CoordinatorConfig,
    error::{CoordinatorError, CoordinatorResult},
    events::{DetectedEvent, EventStore, InMemoryEventStore, TimeRange},
    ingest::{Ack, IngestionRouter, SyncProcessor},
    notifier::{EventListener, EventNotifier, ListenerId},
    template::TemplateValidator,
    token::{DataSource, SourceKind, StreamToken, TokenRegistry},
};

/// Single entry point of the request layer.
///
/// Built once at startup and shared as `Arc<Coordinator>`; it owns the
/// registry, event store and notifier every component works against.
pub struct Coordinator {
    validator: TemplateValidator,
    registry: Arc<TokenRegistry>,
    router: IngestionRouter,
    events: Arc<dyn EventStore>,
    notifier: Arc<EventNotifier>,
    listener_buffer: usize,
}

impl Coordinator {
    pub fn new(
        config: &CoordinatorConfig,
        processor: Arc<dyn SyncProcessor>,
        producer: Arc<dyn BrokerProducer>,
    ) -> Self {
        let registry = Arc::new(TokenRegistry::with_ttl(config.token_ttl_seconds));
        let events: Arc<dyn EventStore> =
            Arc::new(InMemoryEventStore::new(config.event_retention));
        let notifier = Arc::new(EventNotifier::new());
        let router = IngestionRouter::new(
            registry.clone(),
            processor,
            producer,
            events.clone(),
            notifier.clone(),
            config.broker.topic.clone(),
            config.broker.max_message_bytes,
        );

        Self {
            validator: TemplateValidator::new(),
            registry,
            router,
            events,
            notifier,
            listener_buffer: config.listener_buffer,
        }
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    pub fn listener_buffer(&self) -> usize {
        self.listener_buffer
    }

    /// Validate a raw template and issue a token for it.
    ///
    /// Nothing is stored unless the template is valid.
    pub fn process_template(&self, raw_template: &str) -> CoordinatorResult<StreamToken> {
        let template = self.validator.parse(raw_template)?;
        Ok(self.registry.create(template))
    }

    /// Process a batch for `token` before returning.
    pub async fn process_data_sync(
        &self,
        raw_data: &str,
        token: &StreamToken,
    ) -> CoordinatorResult<Ack> {
        self.router.route_sync(token, raw_data).await
    }

    /// Queue a payload on the broker; success only means the broker took it.
    pub fn route_async(&self, raw: &str) -> CoordinatorResult<Ack> {
        self.router.route_async(raw)
    }

    /// Retained events for `token` within `time_range`.
    ///
    /// Only `"ALL"` is supported.
    pub fn get_events(
        &self,
        token: &StreamToken,
        time_range: &str,
    ) -> CoordinatorResult<Vec<DetectedEvent>> {
        let TimeRange::All = time_range.parse::<TimeRange>()?;
        if !self.registry.contains(token) {
            return Err(CoordinatorError::UnknownToken(token.to_string()));
        }
        Ok(self.events.history(token))
    }

    /// Record where the data of `token` comes from.
    pub async fn add_source(
        &self,
        token: &StreamToken,
        kind: SourceKind,
        topic: Option<String>,
    ) -> CoordinatorResult<()> {
        if kind == SourceKind::Kafka && topic.is_none() {
            return Err(CoordinatorError::MalformedData(
                "kafka sources need a topic".to_string(),
            ));
        }

        let source = DataSource { kind, topic };
        self.registry
            .with_exclusive(token, move |definition| {
                definition.source = Some(source);
            })
            .await?;
        info!(token = %token, ?kind, "Attached data source");
        Ok(())
    }

    /// Drop expired stream definitions together with their event history,
    /// returning how many streams were removed.
    pub fn purge_expired(&self) -> usize {
        let expired = self.registry.purge_expired();
        for token in &expired {
            let dropped = self.events.remove(token);
            debug!(token = %token, dropped, "Dropped history of expired stream");
        }
        expired.len()
    }

    /// Broadcast an event detected outside the coordinator.
    pub fn publish_event(&self, event: &DetectedEvent) -> usize {
        self.notifier.publish(event)
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.notifier.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.notifier.unsubscribe(id)
    }
}
