use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    http::{header, HeaderMap},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::api::state::AppState;
use crate::api::v1::response::ApiResponse;
use crate::error::ErrorCode;
use crate::models::{ErrorDetail, ExtractionResult, UploadMeta};
use crate::ocr::LanguageHints;
use crate::processing::ExtractionRequest;

/// Query options shared by both extraction routes.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ExtractQuery {
    /// Language packs to prefer, `+` or `,` separated (e.g. `eng+deu`).
    pub languages: Option<String>,
    /// Original file name. Raw uploads only; multipart takes it from the part.
    pub filename: Option<String>,
}

impl ExtractQuery {
    fn hints(&self) -> LanguageHints {
        self.languages
            .as_deref()
            .map(LanguageHints::parse)
            .unwrap_or_default()
    }
}

async fn run<S, B>(state: &AppState, request: ExtractionRequest, body: S) -> ApiResponse<ExtractionResult>
where
    S: Stream<Item = std::io::Result<B>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
{
    let orchestrator = &state.orchestrator;
    let result = orchestrator
        .extract(request, body, state.shutdown.child_token())
        .await;
    ApiResponse::extraction(result, Some(orchestrator.admission().retry_after_secs()))
}

/// `POST /api/v1/extract`
///
/// Multipart upload. The `file` part carries the media; its filename and
/// content type are taken as the declared metadata.
#[utoipa::path(
    post,
    path = "/api/v1/extract",
    tag = "extract",
    operation_id = "extract.multipart",
    params(ExtractQuery),
    request_body(content_type = "multipart/form-data", content = String, description = "Form with a single `file` part"),
    responses(
        (status = 200, description = "Text extracted (success or partial)", body = ExtractionResult),
        (status = 400, description = "Malformed request", body = ErrorDetail),
        (status = 413, description = "Upload over the size limit", body = ErrorDetail),
        (status = 422, description = "Unsupported or corrupt media", body = ErrorDetail),
        (status = 503, description = "Service saturated, retry later", body = ErrorDetail),
    )
)]
pub async fn extract_multipart(
    State(state): State<AppState>,
    Query(query): Query<ExtractQuery>,
    mut multipart: Multipart,
) -> ApiResponse<ExtractionResult> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return ApiResponse::error(
                    ErrorCode::InvalidRequest,
                    "Multipart form must contain a `file` part",
                );
            }
            Err(e) => {
                return ApiResponse::error(
                    ErrorCode::InvalidRequest,
                    format!("Malformed multipart body: {e}"),
                );
            }
        };

        if field.name() != Some("file") {
            continue;
        }

        let meta = UploadMeta {
            filename: field.file_name().map(str::to_string),
            declared_type: field.content_type().map(str::to_string),
            declared_size: None,
        };
        let request = ExtractionRequest {
            meta,
            languages: query.hints(),
        };
        let body = Box::pin(field.map(|chunk| chunk.map_err(std::io::Error::other)));
        return run(&state, request, body).await;
    }
}

/// `POST /api/v1/extract:raw`
///
/// The request body is the media itself. `Content-Type` and
/// `Content-Length` are the declared type and size.
#[utoipa::path(
    post,
    path = "/api/v1/extract:raw",
    tag = "extract",
    operation_id = "extract.raw",
    params(ExtractQuery),
    request_body(content_type = "application/octet-stream", content = String, description = "Raw image or video bytes"),
    responses(
        (status = 200, description = "Text extracted (success or partial)", body = ExtractionResult),
        (status = 413, description = "Upload over the size limit", body = ErrorDetail),
        (status = 422, description = "Unsupported or corrupt media", body = ErrorDetail),
        (status = 503, description = "Service saturated, retry later", body = ErrorDetail),
    )
)]
pub async fn extract_raw(
    State(state): State<AppState>,
    Query(query): Query<ExtractQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResponse<ExtractionResult> {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let meta = UploadMeta {
        filename: query.filename.clone(),
        declared_type: header_str(header::CONTENT_TYPE),
        declared_size: header_str(header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
    };
    let request = ExtractionRequest {
        meta,
        languages: query.hints(),
    };
    let stream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    );
    run(&state, request, stream).await
}
