use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{AppState, RequestArgs};
use crate::{
    error::CoordinatorError,
    events::{DetectedEvent, TimeRange},
    ingest::leading_token,
    notifier::ChannelListener,
    token::{SourceKind, StreamToken},
};

/// Name under which detected events are pushed to SSE clients
pub const SSE_EVENT_NAME: &str = "event_detected";

const SUCCESS: &str = "Success.";

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
}

/// Handler error rendered as an [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn unknown_kind(kind: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                message: format!("unknown resource kind '{}'", kind),
                code: "unknown_kind".to_string(),
            },
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = match e {
            CoordinatorError::ProducerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::RangeUnsupported(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            body: ErrorResponse {
                message: e.to_string(),
                code: e.code().to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn parse_token(raw: &str) -> Result<StreamToken, CoordinatorError> {
    raw.trim().parse()
}

/// GET /
pub async fn index_handler() -> &'static str {
    "Strom API is up"
}

/// POST /api/define - Validate a template and issue a stream token
pub async fn define_handler(
    State(state): State<AppState>,
    args: RequestArgs,
) -> Result<String, ApiError> {
    let template = args.require("template", CoordinatorError::MalformedTemplate)?;
    match state.coordinator.process_template(template) {
        Ok(token) => Ok(token.to_string()),
        Err(e) => {
            warn!(code = e.code(), error = %e, "Rejected template");
            Err(e.into())
        }
    }
}

/// POST /api/add-source - Record where a stream's data comes from
pub async fn add_source_handler(
    State(state): State<AppState>,
    args: RequestArgs,
) -> Result<&'static str, ApiError> {
    let token = parse_token(args.require("token", CoordinatorError::UnknownToken)?)?;
    let kind: SourceKind = args
        .require("source", CoordinatorError::MalformedData)?
        .parse()?;
    let topic = args
        .get("topic")
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string);

    state.coordinator.add_source(&token, kind, topic).await?;
    Ok(SUCCESS)
}

/// POST /api/load - Process a batch before responding
pub async fn load_handler(
    State(state): State<AppState>,
    args: RequestArgs,
) -> Result<(StatusCode, &'static str), ApiError> {
    let data = args.require("data", CoordinatorError::MalformedData)?;
    let token = leading_token(data)?;

    if let Err(e) = state.coordinator.process_data_sync(data, &token).await {
        warn!(token = %token, code = e.code(), error = %e, "Rejected load");
        return Err(e.into());
    }
    Ok((StatusCode::ACCEPTED, SUCCESS))
}

/// POST /api/kafka/load - Queue a payload on the broker
pub async fn broker_load_handler(
    State(state): State<AppState>,
    args: RequestArgs,
) -> Result<(StatusCode, &'static str), ApiError> {
    let data = args.require("stream_data", CoordinatorError::EncodingFailed)?;

    match state.coordinator.route_async(data) {
        Ok(ack) => {
            debug!(?ack, "Queued broker load");
            Ok((StatusCode::ACCEPTED, SUCCESS))
        }
        Err(e) => {
            warn!(code = e.code(), error = %e, "Rejected broker load");
            Err(e.into())
        }
    }
}

/// GET /api/get/{kind} - Read retained events of a stream
pub async fn get_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    args: RequestArgs,
) -> Result<Json<Vec<DetectedEvent>>, ApiError> {
    if kind != "events" {
        return Err(ApiError::unknown_kind(&kind));
    }

    let range = args.get("range").unwrap_or_default();
    let TimeRange::All = range.parse::<TimeRange>()?;
    let token = parse_token(args.require("token", CoordinatorError::UnknownToken)?)?;

    let events = state.coordinator.get_events(&token, range)?;
    Ok(Json(events))
}

/// POST /new_event - Broadcast an event detected out of band
pub async fn new_event_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let document: Value = serde_json::from_slice(&body)
        .map_err(|e| CoordinatorError::MalformedData(format!("invalid event: {}", e)))?;
    let event = DetectedEvent::from_inbound(document.clone())?;

    let delivered = state.coordinator.publish_event(&event);
    info!(token = ?event.token, kind = %event.kind, delivered, "Broadcast external event");
    Ok(Json(document))
}

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    /// Only forward events of this stream
    pub token: Option<String>,
}

/// GET /api/events - Server-sent stream of detected events
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let filter = query.token.as_deref().map(parse_token).transpose()?;

    let (listener, mut rx) = ChannelListener::new(state.coordinator.listener_buffer());
    let id = state.coordinator.subscribe(Arc::new(listener));
    debug!(listener = id, "SSE client subscribed");

    // The listener is dropped from the notifier on the first publish after
    // the client goes away.
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            // Global events reach every client.
            if filter.is_some_and(|token| event.token.is_some_and(|t| t != token)) {
                continue;
            }
            match SseEvent::default()
                .id(event.id.to_string())
                .event(SSE_EVENT_NAME)
                .json_data(&event)
            {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(error = %e, "Failed to encode event for SSE"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
