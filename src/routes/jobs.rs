use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use super::error::ApiError;
use crate::app_state::AppState;
use crate::models::job::{JobId, JobState};
use crate::models::submission::{
    ChatRequest, JobStatusResponse, RecommendationRequest, StyleTransferRequest, SubmitResponse,
};

/// POST /jobs: submit a style-transfer job.
pub async fn submit_style_transfer(
    State(state): State<AppState>,
    body: Result<Json<StyleTransferRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body?;
    let job_id = state.gateway.submit_style_transfer(request).await?;
    Ok(accepted(job_id))
}

/// POST /chat/jobs: submit a chat question.
pub async fn submit_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body?;
    let job_id = state.gateway.submit_chat(request).await?;
    Ok(accepted(job_id))
}

/// POST /recommendations/jobs: ask for tourism recommendations.
pub async fn submit_recommendation(
    State(state): State<AppState>,
    body: Result<Json<RecommendationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body?;
    let job_id = state.gateway.submit_recommendation(request).await?;
    Ok(accepted(job_id))
}

/// GET /jobs/{job_id}: poll a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    // Malformed IDs cannot name a job.
    let job_id: JobId = job_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("job {} not found", job_id)))?;
    let status = state.gateway.get_status(job_id).await?;
    Ok(Json(status))
}

fn accepted(job_id: JobId) -> (StatusCode, Json<SubmitResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobState::Queued,
        }),
    )
}
