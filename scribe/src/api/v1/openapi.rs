use axum::Json;
use utoipa::OpenApi;
use utoipa_redoc::{Redoc, Servable};

use super::handlers;
use crate::error::ErrorCode;
use crate::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Scribe API",
        version = "1.0.0",
        description = "Self-hostable OCR service. Upload an image or video, get its text back.",
    ),
    paths(
        handlers::health::health_check,
        handlers::extract::extract_multipart,
        handlers::extract::extract_raw,
    ),
    components(schemas(
        ErrorCode,
        models::ErrorDetail,
        models::ExtractionResult,
        models::ExtractionStatus,
        models::RecognitionResult,
        models::FrameStatus,
        models::Token,
        models::BoundingBox,
        models::Transformation,
        models::PreprocessStage,
        handlers::health::HealthData,
        handlers::health::PoolStatus,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "extract", description = "Text extraction from images and video"),
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(utoipa::openapi::security::Http::new(
                utoipa::openapi::security::HttpAuthScheme::Bearer,
            )),
        );
    }
}

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn redoc_router<S: Clone + Send + Sync + 'static>() -> axum::Router<S> {
    Redoc::with_url("/docs", ApiDoc::openapi()).into()
}
