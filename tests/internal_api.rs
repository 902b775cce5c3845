// Internal control API, exercised against the router without sockets.

use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use itwillsync::core::session::SessionStatus;
use itwillsync::hub::internal_api::{router, InternalApiState};
use itwillsync::hub::registry::RegistryHandle;

fn api(registry: RegistryHandle) -> axum::Router {
    router(InternalApiState {
        registry,
        started: Instant::now(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn registration_body() -> Value {
    json!({
        "name": "builder",
        "port": 7964,
        "token": "d".repeat(64),
        "agent": "claude",
        "cwd": "/work/project",
        "pid": std::process::id(),
    })
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_session_count() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn register_returns_201_with_fresh_id() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    let response = app
        .oneshot(post_json("/api/sessions", &registration_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let id = body["session"]["id"].as_str().unwrap();
    assert_eq!(id.len(), 16);
    assert_eq!(body["session"]["status"], "active");

    assert_eq!(registry.size().await, 1);
}

#[tokio::test]
async fn register_with_missing_field_is_400() {
    let registry = RegistryHandle::new();
    let app = api(registry);

    let mut body = registration_body();
    body.as_object_mut().unwrap().remove("token");
    let response = app.oneshot(post_json("/api/sessions", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn heartbeat_revives_idle_sessions_and_404s_unknown_ids() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    let response = app
        .clone()
        .oneshot(post_json("/api/sessions", &registration_body()))
        .await
        .unwrap();
    let body = body_json(response).await;
    let id = body["session"]["id"].as_str().unwrap().to_string();

    registry
        .update_status(&id, SessionStatus::Idle)
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/sessions/{}/heartbeat", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        registry.get_by_id(&id).await.unwrap().status,
        SessionStatus::Active
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/sessions/ffffffffffffffff/heartbeat")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rename_trims_validates_and_updates() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    let response = app
        .clone()
        .oneshot(post_json("/api/sessions", &registration_body()))
        .await
        .unwrap();
    let body = body_json(response).await;
    let id = body["session"]["id"].as_str().unwrap().to_string();

    let rename = |name: Value| {
        Request::builder()
            .method("PUT")
            .uri(format!("/api/sessions/{}/rename", id))
            .header("content-type", "application/json")
            .body(Body::from(json!({ "name": name }).to_string()))
            .unwrap()
    };

    let response = app.clone().oneshot(rename(json!("  "))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.clone().oneshot(rename(json!(" refactor "))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["session"]["name"], "refactor");
    assert_eq!(registry.get_by_id(&id).await.unwrap().name, "refactor");
}

#[tokio::test]
async fn stop_unregisters_only_when_the_signal_fails() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    // A pid that cannot exist: the termination signal fails, so the stop
    // handler removes the entry itself.
    let mut body = registration_body();
    body["pid"] = json!(999_999_999u32);
    let response = app
        .clone()
        .oneshot(post_json("/api/sessions", &body))
        .await
        .unwrap();
    let body = body_json(response).await;
    let id = body["session"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{}/stop", id), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(registry.get_by_id(&id).await.is_none());

    // Unknown ids are a 404, not a silent success.
    let response = app
        .oneshot(post_json("/api/sessions/ffffffffffffffff/stop", &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stop_leaves_a_live_session_registered_for_its_own_exit_path() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    // A real process that receives the signal: the entry must survive the
    // stop call and be cleared by the session's own unregister (or the
    // health sweep), not by the stop handler.
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");

    let mut body = registration_body();
    body["pid"] = json!(child.id());
    let response = app
        .clone()
        .oneshot(post_json("/api/sessions", &body))
        .await
        .unwrap();
    let body = body_json(response).await;
    let id = body["session"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{}/stop", id), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(registry.get_by_id(&id).await.is_some());

    let _ = child.wait();
}

#[tokio::test]
async fn metadata_includes_uptime_and_unregister_removes() {
    let registry = RegistryHandle::new();
    let app = api(registry.clone());

    let response = app
        .clone()
        .oneshot(post_json("/api/sessions", &registration_body()))
        .await
        .unwrap();
    let body = body_json(response).await;
    let id = body["session"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/sessions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body.get("uptimeMs").is_some());
    assert_eq!(body["id"], id.as_str());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(registry.get_by_id(&id).await.is_none());

    let response = app
        .oneshot(
            Request::get(format!("/api/sessions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
