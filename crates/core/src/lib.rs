//! Strom coordinator
//!
//! Issues stream tokens for validated templates and routes data to them.
//!
//! # Features
//!
//! - **Token issuance**: every valid template gets a fresh UUID token
//! - **Synchronous ingestion**: batches are processed in order, one batch per
//!   stream at a time, before the request returns
//! - **Broker hand-off**: payloads are queued on a broker and processed later
//! - **Event fan-out**: detected events are kept per stream and pushed to
//!   listeners (SSE)
//!
//! # Example
//!
//! ```rust,no_run
//! use strom_core::{api, config::Manifest};
//!
//! #[tokio::main]
//! async fn main() {
//!     api::start_server(Manifest::default()).await.unwrap();
//! }
//! ```
//!
//! # Protocol
//!
//! ## Defining a stream
//!
//! ```text
//! POST /api/define HTTP/1.1
//! Content-Type: application/json
//!
//! {"template": "{\"fields\": [\"temperature\"]}"}
//!
//! Response: 200 OK
//! 3f2a9c4e-8d1b-4a57-9e0f-1c2d3e4f5a6b
//! ```
//!
//! ## Loading data
//!
//! ```text
//! POST /api/load HTTP/1.1
//! Content-Type: application/json
//!
//! {"data": "[{\"stream_token\": \"3f2a9c4e-...\", \"temperature\": 21.5}]"}
//!
//! Response: 202 Accepted
//! Success.
//! ```
//!
//! ## Reading events
//!
//! ```text
//! GET /api/get/events?range=ALL&token=3f2a9c4e-... HTTP/1.1
//!
//! Response: 200 OK
//! [{"id": "...", "token": "3f2a9c4e-...", "kind": "record", ...}]
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ingest;
pub mod notifier;
pub mod template;
pub mod token;

// Re-export commonly used items
pub use api::{AppState, ServerError, create_router, start_server};
pub use config::{CoordinatorConfig, Manifest, ServerOptions};
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, CoordinatorResult};
pub use events::DetectedEvent;
pub use ingest::{Ack, SyncProcessor};
pub use token::{StreamStatus, StreamToken};
