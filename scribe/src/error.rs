use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ArtifactState;

#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Corrupt media: {0}")]
    CorruptMedia(String),

    #[error("Recognition timed out after {timeout_ms} ms")]
    RecognitionTimeout { timeout_ms: u64 },

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Decoder unavailable: {0}")]
    DecoderUnavailable(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Service saturated, retry after {retry_after_secs} seconds")]
    Saturated { retry_after_secs: u64 },

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Request deadline of {timeout_secs} seconds exceeded")]
    DeadlineExceeded { timeout_secs: u64 },

    #[error("Invalid artifact transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ArtifactState,
        to: ArtifactState,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Machine-readable failure code carried by every failed or partial result.
///
/// Serialized as snake_case on the wire. Each code maps to one HTTP status
/// via [`ErrorCode::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    PayloadTooLarge,
    UnsupportedType,
    UnsupportedCodec,
    CorruptMedia,
    RecognitionTimeout,
    DeadlineExceeded,
    EngineFailure,
    EngineUnavailable,
    DecoderUnavailable,
    Saturated,
    Cancelled,
    StorageFailure,
    InternalError,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedType | Self::UnsupportedCodec | Self::CorruptMedia => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::RecognitionTimeout | Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::EngineFailure => StatusCode::BAD_GATEWAY,
            Self::EngineUnavailable | Self::DecoderUnavailable | Self::Saturated => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            // nginx's "client closed request"; nobody is usually left to read it
            Self::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::StorageFailure | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::PayloadTooLarge => "payload_too_large",
            Self::UnsupportedType => "unsupported_type",
            Self::UnsupportedCodec => "unsupported_codec",
            Self::CorruptMedia => "corrupt_media",
            Self::RecognitionTimeout => "recognition_timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::EngineFailure => "engine_failure",
            Self::EngineUnavailable => "engine_unavailable",
            Self::DecoderUnavailable => "decoder_unavailable",
            Self::Saturated => "saturated",
            Self::Cancelled => "cancelled",
            Self::StorageFailure => "storage_failure",
            Self::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

impl ScribeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ScribeError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            ScribeError::UnsupportedType(_) => ErrorCode::UnsupportedType,
            ScribeError::UnsupportedCodec(_) => ErrorCode::UnsupportedCodec,
            ScribeError::CorruptMedia(_) => ErrorCode::CorruptMedia,
            ScribeError::RecognitionTimeout { .. } => ErrorCode::RecognitionTimeout,
            ScribeError::EngineFailure(_) => ErrorCode::EngineFailure,
            ScribeError::EngineUnavailable(_) => ErrorCode::EngineUnavailable,
            ScribeError::DecoderUnavailable(_) => ErrorCode::DecoderUnavailable,
            ScribeError::Storage(_) => ErrorCode::StorageFailure,
            ScribeError::Saturated { .. } => ErrorCode::Saturated,
            ScribeError::Cancelled(_) => ErrorCode::Cancelled,
            ScribeError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            ScribeError::Validation(_) => ErrorCode::InvalidRequest,
            ScribeError::InvalidTransition { .. } | ScribeError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Message safe to return across the HTTP boundary.
    ///
    /// Storage and internal errors are logged and replaced with a generic
    /// sentence; everything else already describes the caller's input.
    pub fn public_message(&self) -> String {
        match self {
            ScribeError::Storage(e) => {
                tracing::error!(error = %e, "Scratch storage failure");
                "Scratch storage failure while handling the upload".to_string()
            }
            ScribeError::EngineFailure(_) => "Text recognition engine failed".to_string(),
            ScribeError::EngineUnavailable(_) => {
                "Text recognition engine is not available".to_string()
            }
            ScribeError::DecoderUnavailable(_) => "Video decoder is not available".to_string(),
            ScribeError::InvalidTransition { .. } | ScribeError::Internal(_) => {
                tracing::error!(error = %self, "Internal error mapped to response");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScribeError>;
