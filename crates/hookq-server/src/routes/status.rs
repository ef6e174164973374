use axum::extract::{Query, State};
use axum::Json;
use hookq_core::store::StatusCounts;
use hookq_core::StatusSummary;

use crate::error::{blocking, AppError};
use crate::state::AppState;

#[derive(serde::Deserialize)]
pub struct CountsParams {
    pub group: Option<String>,
}

/// GET /api/counts?group=<group>: totals for every status.
pub async fn get_counts(
    State(app): State<AppState>,
    Query(params): Query<CountsParams>,
) -> Result<Json<StatusCounts>, AppError> {
    let service = app.status();
    let counts = blocking(move || service.counts(params.group.as_deref())).await?;
    Ok(Json(counts))
}

/// GET /api/summary
pub async fn get_summary(State(app): State<AppState>) -> Result<Json<StatusSummary>, AppError> {
    let service = app.status();
    let summary = blocking(move || service.summary()).await?;
    Ok(Json(summary))
}
