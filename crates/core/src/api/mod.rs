//! HTTP surface of the coordinator.

mod args;
mod endpoints;

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::Method,
    routing::{get, post},
};
use crossbeam_channel::Receiver;
use tokio::runtime::Handle;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use args::RequestArgs;
pub use endpoints::{ApiError, ErrorResponse, EventStreamQuery, SSE_EVENT_NAME};

use crate::{
    broker::{BrokerError, BrokerMessage, BrokerProducer, InMemoryBroker, spawn_broker_consumer},
    config::{BrokerConfig, Manifest, ServerOptions},
    coordinator::Coordinator,
    ingest::RuleProcessor,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub options: ServerOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to start broker producer: {0}")]
    Broker(#[from] BrokerError),
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Create the router with all coordinator endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(endpoints::index_handler))
        .route("/api/define", post(endpoints::define_handler))
        .route("/api/add-source", post(endpoints::add_source_handler))
        .route("/api/load", post(endpoints::load_handler))
        .route("/api/kafka/load", post(endpoints::broker_load_handler))
        .route("/kafka/load", post(endpoints::broker_load_handler))
        .route("/api/get/{kind}", get(endpoints::get_handler))
        .route("/new_event", post(endpoints::new_event_handler))
        .route("/api/events", get(endpoints::events_handler))
        .layer(cors)
        .with_state(state)
}

type ProducerParts = (Arc<dyn BrokerProducer>, Option<Receiver<BrokerMessage>>);

/// Pick the broker producer for `config`.
///
/// The in-process broker comes with a receiver for the local consumer; Kafka
/// topics are drained by consumers outside this process.
fn build_producer(config: &BrokerConfig) -> Result<ProducerParts, BrokerError> {
    if let Some(brokers) = &config.kafka_brokers {
        #[cfg(feature = "kafka")]
        {
            let producer: Arc<dyn BrokerProducer> =
                Arc::new(crate::broker::kafka::KafkaProducer::new(brokers)?);
            return Ok((producer, None));
        }
        #[cfg(not(feature = "kafka"))]
        {
            return Err(BrokerError::Client(format!(
                "kafka brokers {} configured but the kafka feature is disabled",
                brokers
            )));
        }
    }

    let (broker, receiver) = InMemoryBroker::new(config.capacity);
    let producer: Arc<dyn BrokerProducer> = broker;
    Ok((producer, Some(receiver)))
}

/// Start the coordinator HTTP server.
pub async fn start_server(manifest: Manifest) -> Result<(), ServerError> {
    let config = &manifest.coordinator;
    let (producer, receiver) = build_producer(&config.broker)?;
    let coordinator = Arc::new(Coordinator::new(config, Arc::new(RuleProcessor), producer));

    if let Some(receiver) = receiver {
        spawn_broker_consumer(receiver, coordinator.clone(), Handle::current());
    }

    if let Some(ttl) = config.token_ttl_seconds {
        let coordinator = coordinator.clone();
        let period = Duration::from_secs(ttl.clamp(1, 3600));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let purged = coordinator.purge_expired();
                if purged > 0 {
                    info!(purged, "Evicted expired stream definitions");
                }
            }
        });
    }

    let options = manifest.server.clone();
    let state = AppState {
        coordinator,
        options: options.clone(),
    };
    let router = create_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting coordinator server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::CoordinatorConfig,
        events::{DetectedEvent, EXTERNAL_EVENT_KIND},
        notifier::ChannelListener,
    };

    const TEMPLATE: &str = r#"{"fields":["a","b"]}"#;

    struct TestApp {
        router: Router,
        coordinator: Arc<Coordinator>,
        broker: Arc<InMemoryBroker>,
        _receiver: Receiver<BrokerMessage>,
    }

    fn create_test_app_with(config: CoordinatorConfig) -> TestApp {
        let (broker, receiver) = InMemoryBroker::new(config.broker.capacity);
        let coordinator = Arc::new(Coordinator::new(
            &config,
            Arc::new(RuleProcessor),
            broker.clone(),
        ));
        let router = create_router(AppState {
            coordinator: coordinator.clone(),
            options: ServerOptions::default(),
        });
        TestApp {
            router,
            coordinator,
            broker,
            _receiver: receiver,
        }
    }

    fn create_test_app() -> TestApp {
        create_test_app_with(CoordinatorConfig::default())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router.clone().oneshot(request).await.unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_code(response: Response) -> String {
        let error: ErrorResponse = serde_json::from_str(&body_string(response).await).unwrap();
        error.code
    }

    async fn define(app: &TestApp) -> String {
        let response = send(app, post_json("/api/define", json!({"template": TEMPLATE}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_string(response).await
    }

    fn load_body(token: &str, rows: Value) -> Value {
        let rows: Vec<Value> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|row| {
                let mut row = row.as_object().cloned().unwrap();
                row.insert("stream_token".into(), json!(token));
                Value::Object(row)
            })
            .collect();
        json!({ "data": Value::Array(rows).to_string() })
    }

    #[tokio::test]
    async fn test_index() {
        let app = create_test_app();
        let response = send(&app, get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Strom API is up");
    }

    #[tokio::test]
    async fn test_define_load_get() {
        let app = create_test_app();
        let token = define(&app).await;

        let response = send(
            &app,
            post_json("/api/load", load_body(&token, json!([{"a": 1, "b": 2}]))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_string(response).await, "Success.");

        let response = send(&app, get(&format!("/api/get/events?range=ALL&token={}", token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let events: Vec<DetectedEvent> =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token.map(|t| t.to_string()).as_deref(), Some(token.as_str()));
        assert_eq!(events[0].payload, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn test_define_accepts_form_and_inline_json() {
        let app = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/api/define")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Body::from("template=%7B%22fields%22%3A%5B%22a%22%5D%7D"))
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::OK);

        let request = post_json("/api/define", json!({"template": {"fields": ["a"]}}));
        assert_eq!(send(&app, request).await.status(), StatusCode::OK);

        assert_eq!(app.coordinator.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_define_rejects_bad_templates() {
        let app = create_test_app();

        let response = send(&app, post_json("/api/define", json!({"template": "{"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "malformed_template");

        let response = send(&app, post_json("/api/define", json!({"template": "{\"fields\":7}"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "schema_invalid");

        let response = send(&app, post_json("/api/define", json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "malformed_template");

        assert!(app.coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_load_unknown_token() {
        let app = create_test_app();
        let response = send(
            &app,
            post_json("/api/load", json!({"data": r#"[{"stream_token":"T9","a":1}]"#})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "unknown_token");
    }

    #[tokio::test]
    async fn test_load_malformed_data() {
        let app = create_test_app();
        let token = define(&app).await;

        let response = send(&app, post_json("/api/load", json!({"data": "not json"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "malformed_data");

        let response = send(
            &app,
            post_json("/api/load", load_body(&token, json!([{"a": 1}]))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "processing_failed");
    }

    #[tokio::test]
    async fn test_get_rejects_ranges_and_kinds() {
        let app = create_test_app();
        let token = define(&app).await;

        let response = send(&app, get(&format!("/api/get/events?range=1h&token={}", token))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(response).await, "range_unsupported");

        let response = send(&app, get(&format!("/api/get/raw?range=ALL&token={}", token))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, get("/api/get/events?range=ALL&token=T9")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "unknown_token");
    }

    #[tokio::test]
    async fn test_broker_load() {
        let app = create_test_app();

        for uri in ["/api/kafka/load", "/kafka/load"] {
            let body = json!({"stream_data": r#"[{"stream_token":"T9","a":1}]"#});
            let response = send(&app, post_json(uri, body)).await;
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        assert_eq!(app.broker.produced(), 2);

        let response = send(&app, post_json("/kafka/load", json!({"stream_data": "{nope"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "encoding_failed");

        let response = send(&app, post_json("/kafka/load", json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.broker.produced(), 2);
    }

    #[tokio::test]
    async fn test_broker_load_backpressure() {
        let mut config = CoordinatorConfig::default();
        config.broker.capacity = 1;
        let app = create_test_app_with(config);

        let body = json!({"stream_data": "[1]"});
        let response = send(&app, post_json("/api/kafka/load", body.clone())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = send(&app, post_json("/api/kafka/load", body)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "producer_unavailable");
    }

    #[tokio::test]
    async fn test_add_source() {
        let app = create_test_app();
        let token = define(&app).await;

        let body = json!({"token": token, "source": "kafka", "topic": "sensors"});
        let response = send(&app, post_json("/api/add-source", body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Success.");

        let body = json!({"token": token, "source": "carrier-pigeon"});
        let response = send(&app, post_json("/api/add-source", body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_new_event_broadcasts() {
        let app = create_test_app();
        let token = define(&app).await;
        let (listener, mut rx) = ChannelListener::new(4);
        app.coordinator.subscribe(Arc::new(listener));

        let document = json!({"stream_token": token, "kind": "anomaly", "score": 0.9});
        let response = send(&app, post_json("/new_event", document.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let echoed: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(echoed, document);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, "anomaly");
        assert_eq!(event.payload, document);

        let response = send(&app, post_json("/new_event", json!({"stream_token": "T9"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_event_without_token_is_global() {
        let app = create_test_app();
        let token = define(&app).await;
        let (listener, mut rx) = ChannelListener::new(4);
        app.coordinator.subscribe(Arc::new(listener));

        let document = json!({"score": 1});
        let response = send(&app, post_json("/new_event", document.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.token, None);
        assert_eq!(event.kind, EXTERNAL_EVENT_KIND);
        assert_eq!(event.payload, document);

        // Broadcast only; no stream history picks it up.
        let response = send(&app, get(&format!("/api/get/events?range=ALL&token={}", token))).await;
        let events: Vec<DetectedEvent> =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_event_stream_subscribes() {
        let app = create_test_app();
        let response = send(&app, get("/api/events")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(app.coordinator.notifier().listener_count(), 1);

        let response = send(&app, get("/api/events?token=T9")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let app = create_test_app();
        let request = Request::builder()
            .uri("/")
            .header(header::ORIGIN, "http://example.com")
            .body(Body::empty())
            .unwrap();

        let response = send(&app, request).await;
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[test]
    fn test_build_producer_in_memory() {
        let (_, receiver) = build_producer(&BrokerConfig::default()).unwrap();
        assert!(receiver.is_some());
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_build_producer_without_kafka_feature() {
        let config = BrokerConfig {
            kafka_brokers: Some("127.0.0.1:9092".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_producer(&config),
            Err(BrokerError::Client(_))
        ));
    }
}
