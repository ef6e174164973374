use axum::http::StatusCode;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hookq_core::{ActionStore, ClaimRequest, ManualClock, MemoryStore, NewAction, RedbStore};
use hookq_server::{build_router, AppState};
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn app_with(store: Arc<dyn ActionStore>) -> axum::Router {
    build_router(AppState::new(store, Arc::new(ManualClock::new(t0()))))
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_then_get() {
    let store = Arc::new(MemoryStore::new());
    let app = app_with(store.clone());

    let (status, created) = post_json(
        app.clone(),
        "/api/actions",
        serde_json::json!({
            "hook": "send-digest",
            "args": [42],
            "schedule": { "type": "interval", "start": "2026-03-01T12:00:00Z", "every_secs": 60 },
            "group": "mail",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["hook"], "send-digest");

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = get(app, &format!("/api/actions/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["group"], "mail");
    assert_eq!(fetched["schedule"]["every_secs"], 60);
}

#[tokio::test]
async fn enqueue_rejects_bad_schedule() {
    let app = app_with(Arc::new(MemoryStore::new()));
    for expression in ["not a cron", "59/4294967295 * * * *"] {
        let (status, body) = post_json(
            app.clone(),
            "/api/actions",
            serde_json::json!({
                "hook": "tick",
                "schedule": { "type": "cron", "expression": expression },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{expression}");
        assert!(body["error"].as_str().unwrap().contains("schedule"));
    }
}

#[tokio::test]
async fn unknown_action_is_404() {
    let app = app_with(Arc::new(MemoryStore::new()));
    let (status, _) = get(app, &format!("/api/actions/{}", uuid::Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_and_pages() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        let new_action = NewAction::single("h", t0() + Duration::minutes(i))
            .in_group(if i % 2 == 0 { "even" } else { "odd" });
        store.enqueue(new_action, t0()).unwrap();
    }
    let app = app_with(store);

    let (status, body) = get(app.clone(), "/api/actions?group=even&sort=next-due&order=desc").await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows[0]["next_due_at"].as_str() > rows[2]["next_due_at"].as_str());

    let (_, page) = get(app.clone(), "/api/actions?limit=2&offset=4").await;
    assert_eq!(page.as_array().unwrap().len(), 1);

    let (status, _) = get(app, "/api/actions?status=sleeping").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inverted_due_range_is_400() {
    let app = app_with(Arc::new(MemoryStore::new()));
    let (status, body) = get(
        app,
        "/api/actions?due_after=2026-03-02T00:00:00Z&due_before=2026-03-01T00:00:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("due_after"));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let a = store.enqueue(NewAction::single("h", t0()), t0()).unwrap();
    let app = app_with(store);
    let uri = format!("/api/actions/{}/cancel", a.id);

    let (status, first) = post_json(app.clone(), &uri, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["outcome"], "canceled");
    assert_eq!(first["action"]["status"], "canceled");

    let (status, second) = post_json(app, &uri, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "unchanged");
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counts_include_every_status() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RedbStore::open(&dir.path().join("actions.redb")).unwrap());
    store
        .enqueue(NewAction::single("h", t0()).in_group("g"), t0())
        .unwrap();
    store.enqueue(NewAction::single("h", t0()), t0()).unwrap();
    let app = app_with(store);

    let (status, all) = get(app.clone(), "/api/counts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all["pending"], 2);
    assert_eq!(all["in-progress"], 0);
    assert_eq!(all["canceled"], 0);

    let (_, group) = get(app, "/api/counts?group=g").await;
    assert_eq!(group["pending"], 1);
}

#[tokio::test]
async fn summary_reports_in_progress() {
    let store = Arc::new(MemoryStore::new());
    store
        .enqueue(NewAction::single("h", t0() - Duration::minutes(1)), t0())
        .unwrap();
    store
        .enqueue(NewAction::single("later", t0() + Duration::hours(1)), t0())
        .unwrap();
    store
        .claim(&ClaimRequest::new("w", 1, std::time::Duration::from_secs(60), t0()))
        .unwrap();
    let app = app_with(store);

    let (status, body) = get(app, "/api/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"]["in-progress"], 1);
    assert_eq!(body["next_due"]["hook"], "later");
    assert_eq!(body["overdue"], 0);
}
