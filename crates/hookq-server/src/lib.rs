pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Actions
        .route("/api/actions", get(routes::actions::list_actions))
        .route("/api/actions", post(routes::actions::enqueue_action))
        .route("/api/actions/{id}", get(routes::actions::get_action))
        .route(
            "/api/actions/{id}/cancel",
            post(routes::actions::cancel_action),
        )
        // Reporting
        .route("/api/counts", get(routes::status::get_counts))
        .route("/api/summary", get(routes::status::get_summary))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the API on `port` until the process is stopped.
pub async fn serve(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    serve_on(app_state, listener, std::future::pending()).await
}

/// Serve the API on a pre-bound listener until `shutdown` resolves.
///
/// Accepting a bound `TcpListener` lets the caller read the actual port
/// first (useful when `port = 0` and the OS picks a free port).
pub async fn serve_on<F>(
    app_state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let actual_port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("hookq API listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
