//! Purge job route handlers

use crate::error::ApiResult;
use crate::models::{PurgeReport, SuccessResponse};
use crate::purge::PurgeJob;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

/// Run one purge job by name
pub async fn run_job(
    State(state): State<SharedState>,
    Path(job): Path<String>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<PurgeReport>>)> {
    let job: PurgeJob = job.parse()?;
    info!(job = job.name(), "Purge requested");

    let report = state.compliance.purge(job).await?;
    let message = format!("{} rows purged from {}", report.rows_affected, report.table);
    Ok((StatusCode::ACCEPTED, Json(SuccessResponse::with_data(message, report))))
}
