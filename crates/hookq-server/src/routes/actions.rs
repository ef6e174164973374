use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use hookq_core::{Action, ActionFilter, ActionQuery, ActionStatus, Clock, NewAction};
use uuid::Uuid;

use crate::error::{blocking, AppError};
use crate::state::AppState;

/// Largest page a single list request may ask for.
pub const MAX_PAGE: usize = 1000;

#[derive(Debug, Default, serde::Deserialize)]
pub struct ListParams {
    /// Comma-separated statuses.
    pub status: Option<String>,
    pub group: Option<String>,
    pub hook: Option<String>,
    pub search: Option<String>,
    pub due_after: Option<DateTime<Utc>>,
    pub due_before: Option<DateTime<Utc>>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListParams {
    fn into_query(self) -> Result<ActionQuery, AppError> {
        let statuses = match self.status.as_deref() {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<ActionStatus>)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        if self.limit.is_some_and(|l| l > MAX_PAGE) {
            return Err(AppError::bad_request(format!(
                "limit may not exceed {MAX_PAGE}"
            )));
        }

        let mut query = ActionQuery::new(ActionFilter {
            statuses,
            group: self.group,
            hook: self.hook,
            due_after: self.due_after,
            due_before: self.due_before,
            search: self.search,
        });
        if let Some(sort) = self.sort.as_deref() {
            query.sort = sort.parse()?;
        }
        if let Some(order) = self.order.as_deref() {
            query.order = order.parse()?;
        }
        query.limit = self.limit;
        query.offset = self.offset.unwrap_or(0);
        query.validate()?;
        Ok(query)
    }
}

/// GET /api/actions: one page of matching actions.
pub async fn list_actions(
    State(app): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Action>>, AppError> {
    let query = params.into_query()?;
    let store = app.store.clone();
    let actions = blocking(move || store.query(&query)).await?;
    Ok(Json(actions))
}

/// POST /api/actions: enqueue. Unique enqueues may return an existing action.
pub async fn enqueue_action(
    State(app): State<AppState>,
    Json(new_action): Json<NewAction>,
) -> Result<(StatusCode, Json<Action>), AppError> {
    let store = app.store.clone();
    let now = app.clock.now();
    let action = blocking(move || store.enqueue(new_action, now)).await?;
    tracing::info!(action_id = %action.id, hook = %action.hook, "enqueued via API");
    Ok((StatusCode::CREATED, Json(action)))
}

/// GET /api/actions/{id}: full action including event history.
pub async fn get_action(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Action>, AppError> {
    let store = app.store.clone();
    let action = blocking(move || store.get(id)).await?;
    Ok(Json(action))
}

/// POST /api/actions/{id}/cancel
pub async fn cancel_action(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let now = app.clock.now();
    let (outcome, action) = blocking(move || {
        let outcome = store.cancel(id, now)?;
        Ok((outcome, store.get(id)?))
    })
    .await?;
    Ok(Json(serde_json::json!({
        "outcome": outcome,
        "action": action,
    })))
}
