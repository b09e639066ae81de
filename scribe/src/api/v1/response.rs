//! # V1 response envelope
//!
//! Every v1 endpoint answers with the same shape:
//!
//! ```json
//! {
//!   "data": { ... },
//!   "error": { "code": "corrupt_media", "message": "..." }
//! }
//! ```
//!
//! `data` is present on success. `error` is present on failure. Failed
//! extractions carry both, so clients still get per-frame detail.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::models::{ErrorDetail, ExtractionResult, ExtractionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// Not serialized; drives the HTTP status line.
    #[serde(skip)]
    status: StatusCode,
    #[serde(skip)]
    retry_after_secs: Option<u64>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Success response with data (HTTP 200).
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            status: StatusCode::OK,
            retry_after_secs: None,
        }
    }

    /// Error response. HTTP status is derived from the [`ErrorCode`].
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(ErrorDetail {
                code,
                message: message.into(),
            }),
            status: code.status(),
            retry_after_secs: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl ApiResponse<ExtractionResult> {
    /// Success and partial results answer 200. Failed results keep their
    /// data and take the status of their error code.
    pub fn extraction(result: ExtractionResult, retry_after_secs: Option<u64>) -> Self {
        let error = match result.status {
            ExtractionStatus::Failed => result.error.clone().or_else(|| {
                Some(ErrorDetail {
                    code: ErrorCode::InternalError,
                    message: "Extraction failed".to_string(),
                })
            }),
            _ => None,
        };
        let status = error
            .as_ref()
            .map(|e| e.code.status())
            .unwrap_or(StatusCode::OK);
        let retry_after_secs = match error.as_ref().map(|e| e.code) {
            Some(ErrorCode::Saturated) => retry_after_secs,
            _ => None,
        };

        Self {
            data: Some(result),
            error,
            status,
            retry_after_secs,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self.status;
        let retry_after = self.retry_after_secs;
        let mut response = match serde_json::to_value(&self) {
            Ok(body) => (status, Json(body)).into_response(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize response envelope");
                let body = serde_json::json!({
                    "error": {
                        "code": "internal_error",
                        "message": "An internal error occurred"
                    }
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        };

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
