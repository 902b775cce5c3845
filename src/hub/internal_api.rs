//! Loopback-only control API.
//!
//! Sessions register, heartbeat, and unregister here; the CLI queries it
//! out-of-band. It binds 127.0.0.1 only, so the OS is the auth layer.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::core::protocol::SessionMetadata;
use crate::core::session::{now_ms, SessionRegistration};
use crate::hub::process::{resident_memory_bytes, terminate};
use crate::hub::registry::RegistryHandle;

#[derive(Clone)]
pub struct InternalApiState {
    pub registry: RegistryHandle,
    pub started: Instant,
}

pub fn router(state: InternalApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(register_session))
        .route(
            "/api/sessions/:id",
            get(session_metadata).delete(unregister_session),
        )
        .route("/api/sessions/:id/heartbeat", put(heartbeat))
        .route("/api/sessions/:id/stop", post(stop_session))
        .route("/api/sessions/:id/rename", put(rename_session))
        .with_state(state)
}

/// Collect on-demand metadata for one session: registry entry plus uptime
/// and best-effort resident memory.
pub async fn collect_metadata(registry: &RegistryHandle, id: &str) -> Option<SessionMetadata> {
    let session = registry.get_by_id(id).await?;
    let uptime_ms = now_ms().saturating_sub(session.connected_at);
    let memory_bytes = resident_memory_bytes(session.pid).await;
    Some(SessionMetadata {
        session,
        uptime_ms,
        memory_bytes,
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn health(State(state): State<InternalApiState>) -> Response {
    let sessions = state.registry.size().await;
    Json(json!({
        "status": "ok",
        "sessions": sessions,
        "uptime": state.started.elapsed().as_secs(),
    }))
    .into_response()
}

async fn list_sessions(State(state): State<InternalApiState>) -> Response {
    let sessions = state.registry.get_all().await;
    Json(json!({ "sessions": sessions })).into_response()
}

async fn register_session(
    State(state): State<InternalApiState>,
    Json(body): Json<Value>,
) -> Response {
    // Field-by-field extraction keeps the error a 400 with a message
    // instead of a framework rejection.
    let port = body.get("port").and_then(Value::as_u64);
    let token = body.get("token").and_then(Value::as_str);
    let agent = body.get("agent").and_then(Value::as_str);
    let cwd = body.get("cwd").and_then(Value::as_str);
    let pid = body.get("pid").and_then(Value::as_u64);
    let (Some(port), Some(token), Some(agent), Some(cwd), Some(pid)) =
        (port, token, agent, cwd, pid)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing required field (port, token, agent, cwd, pid)",
        );
    };

    let name = body
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("agent")
        .to_string();

    let registration = SessionRegistration {
        name,
        port: port as u16,
        token: token.to_string(),
        agent: agent.to_string(),
        cwd: cwd.to_string(),
        pid: pid as u32,
    };

    match state.registry.register(registration).await {
        Ok(session) => {
            (StatusCode::CREATED, Json(json!({ "session": session }))).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn session_metadata(
    State(state): State<InternalApiState>,
    Path(id): Path<String>,
) -> Response {
    match collect_metadata(&state.registry, &id).await {
        Some(metadata) => Json(metadata).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "session not found"),
    }
}

async fn unregister_session(
    State(state): State<InternalApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.unregister(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "session not found"),
    }
}

async fn heartbeat(State(state): State<InternalApiState>, Path(id): Path<String>) -> Response {
    match state.registry.heartbeat(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "session not found"),
    }
}

async fn stop_session(State(state): State<InternalApiState>, Path(id): Path<String>) -> Response {
    let Some(session) = state.registry.get_by_id(&id).await else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };
    // On a delivered signal the session unregisters itself on its exit path
    // (or the health sweep reaps it); the entry stays until then. Only a
    // failed signal means the process is already gone.
    if !terminate(session.pid) {
        tracing::debug!("terminate failed for pid {}, unregistering", session.pid);
        let _ = state.registry.unregister(&id).await;
    }
    Json(json!({ "ok": true })).into_response()
}

async fn rename_session(
    State(state): State<InternalApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let Some(name) = name else {
        return error_response(StatusCode::BAD_REQUEST, "missing name");
    };
    match state.registry.rename(&id, name).await {
        Ok(session) => Json(json!({ "ok": true, "session": session })).into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "session not found"),
    }
}
