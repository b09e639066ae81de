use axum::extract::State;
use serde::Serialize;

use crate::api::state::AppState;
use crate::api::v1::response::ApiResponse;

/// Health data returned inside the v1 envelope.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub engine_pool: PoolStatus,
    pub requests: PoolStatus,
    pub languages: Vec<String>,
}

/// Configured size of a bounded resource and how much of it is free.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
}

/// `GET /api/v1/health`
///
/// Answers from in-memory counters only; never touches the pipeline.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "health",
    responses(
        (status = 200, description = "Service health status", body = HealthData),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> ApiResponse<HealthData> {
    let ocr = state.orchestrator.ocr();
    let admission = state.orchestrator.admission();

    ApiResponse::success(HealthData {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        engine_pool: PoolStatus {
            size: ocr.pool().size(),
            available: ocr.pool().available(),
        },
        requests: PoolStatus {
            size: admission.limit(),
            available: admission.limit() - admission.in_flight(),
        },
        languages: ocr.languages().to_vec(),
    })
}
