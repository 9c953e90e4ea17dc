use crate::token::{StreamStatus, StreamToken};

/// Errors surfaced by the coordinator to its callers.
///
/// Every variant maps to a stable [`CoordinatorError::code`] so the request
/// layer can tell bad input apart from unknown tokens and unavailable
/// downstream services.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Malformed template: {0}")]
    MalformedTemplate(String),

    #[error("Invalid template schema: {0}")]
    SchemaInvalid(String),

    #[error("Unknown stream token: {0}")]
    UnknownToken(String),

    #[error("Stream {token} is {status} and cannot accept data")]
    StreamInactive {
        token: StreamToken,
        status: StreamStatus,
    },

    #[error("Malformed data: {0}")]
    MalformedData(String),

    #[error("Processing failed after {processed} of {total} records: {reason}")]
    ProcessingFailed {
        processed: usize,
        total: usize,
        reason: String,
    },

    #[error("Failed to encode payload: {0}")]
    EncodingFailed(String),

    #[error("Broker producer unavailable: {0}")]
    ProducerUnavailable(String),

    #[error("Unsupported time range: {0}")]
    RangeUnsupported(String),
}

impl CoordinatorError {
    /// Snake-case identifier of the error kind, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::MalformedTemplate(_) => "malformed_template",
            CoordinatorError::SchemaInvalid(_) => "schema_invalid",
            CoordinatorError::UnknownToken(_) => "unknown_token",
            CoordinatorError::StreamInactive { .. } => "stream_inactive",
            CoordinatorError::MalformedData(_) => "malformed_data",
            CoordinatorError::ProcessingFailed { .. } => "processing_failed",
            CoordinatorError::EncodingFailed(_) => "encoding_failed",
            CoordinatorError::ProducerUnavailable(_) => "producer_unavailable",
            CoordinatorError::RangeUnsupported(_) => "range_unsupported",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::ProducerUnavailable(_))
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
