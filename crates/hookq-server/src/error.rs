use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hookq_core::error::HookqError;

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(HookqError::InvalidQuery(msg.into()).into())
    }
}

fn status_for(e: &HookqError) -> StatusCode {
    match e {
        HookqError::ActionNotFound(_) | HookqError::ClaimNotFound(_) => StatusCode::NOT_FOUND,
        HookqError::InvalidQuery(_)
        | HookqError::InvalidSchedule(_)
        | HookqError::InvalidHook(_)
        | HookqError::NotInitialized => StatusCode::BAD_REQUEST,
        HookqError::StaleClaim { .. } | HookqError::HandlerExists(_) => StatusCode::CONFLICT,
        HookqError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        HookqError::UnknownHandler(_)
        | HookqError::CommandNotFound(_)
        | HookqError::Io(_)
        | HookqError::Yaml(_)
        | HookqError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<HookqError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": format!("{:#}", self.0) });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Run a blocking store call off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> hookq_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))?;
    Ok(result?)
}
