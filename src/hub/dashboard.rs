//! Dashboard server.
//!
//! The one externally reachable surface of the hub. Every page and upgrade
//! requires the master token (constant-time compared, rate-limited per IP);
//! bundled static assets under `/assets/` are the only exemption. A single
//! WebSocket per dashboard carries the session list, registry deltas,
//! preview frames, and session operations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use crate::core::protocol::{DashboardMessage, DashboardRequest};
use crate::core::session::SessionStatus;
use crate::core::token::constant_time_eq;
use crate::hub::internal_api::collect_metadata;
use crate::hub::preview::PreviewCollector;
use crate::hub::process::terminate;
use crate::hub::rate_limit::RateLimiter;
use crate::hub::registry::{RegistryEvent, RegistryHandle};
use crate::server::static_files::{accepts_gzip, AssetCache};

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct DashboardState {
    pub registry: RegistryHandle,
    pub master_token: Arc<String>,
    pub rate_limiter: Arc<RateLimiter>,
    pub collector: Arc<PreviewCollector>,
    pub assets: Arc<AssetCache>,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/assets/*path", get(asset_handler))
        .route("/*path", get(page_handler))
        .with_state(state)
}

/// Master-token gate. Blocked IPs are refused before the comparison so a
/// correct token cannot punch through an active block.
fn authorize(
    state: &DashboardState,
    addr: SocketAddr,
    params: &HashMap<String, String>,
) -> Result<(), Response> {
    let ip = addr.ip();
    if state.rate_limiter.is_blocked(ip) {
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many attempts").into_response());
    }
    let supplied = params.get("token").map(String::as_str).unwrap_or("");
    if constant_time_eq(supplied.as_bytes(), state.master_token.as_bytes()) {
        state.rate_limiter.clear(ip);
        Ok(())
    } else {
        state.rate_limiter.record_failure(ip);
        Err((StatusCode::UNAUTHORIZED, "Unauthorized").into_response())
    }
}

async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<DashboardState>,
) -> Response {
    if let Err(rejection) = authorize(&state, addr, &params) {
        return rejection;
    }
    match ws {
        Some(upgrade) => upgrade.on_upgrade(move |socket| dashboard_socket(socket, state)),
        None => state.assets.serve("/", accepts_gzip(&headers)).await,
    }
}

/// Bundled build artifacts; no auth, no secrets.
async fn asset_handler(
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
    State(state): State<DashboardState>,
) -> Response {
    state
        .assets
        .serve(&format!("/assets/{}", path), accepts_gzip(&headers))
        .await
}

async fn page_handler(
    AxumPath(path): AxumPath<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<DashboardState>,
) -> Response {
    if let Err(rejection) = authorize(&state, addr, &params) {
        return rejection;
    }
    state
        .assets
        .serve(&format!("/{}", path), accepts_gzip(&headers))
        .await
}

async fn dashboard_socket(socket: WebSocket, state: DashboardState) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe before the snapshot so no registry mutation can fall in the
    // gap; a duplicated update frame is harmless.
    let mut registry_events = state.registry.subscribe();
    let mut preview_events = state.collector.subscribe();

    let sessions = state.registry.get_all().await;
    if send_frame(&mut sink, &DashboardMessage::Sessions { sessions })
        .await
        .is_err()
    {
        return;
    }
    for (session_id, lines) in state.collector.snapshot() {
        if send_frame(&mut sink, &DashboardMessage::Preview { session_id, lines })
            .await
            .is_err()
        {
            return;
        }
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;
    let mut pong_seen = true;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(request) = serde_json::from_str::<DashboardRequest>(&text) else {
                            continue;
                        };
                        if let Some(reply) = handle_request(&state, request).await {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pong_seen = true,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            event = registry_events.recv() => {
                match event {
                    Ok(event) => {
                        let frame = match event {
                            RegistryEvent::Added(session) => DashboardMessage::SessionAdded { session },
                            RegistryEvent::Removed { id } => DashboardMessage::SessionRemoved { session_id: id },
                            RegistryEvent::Updated(session) => DashboardMessage::SessionUpdated { session },
                        };
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("dashboard client lagged {} registry events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = preview_events.recv() => {
                match event {
                    Ok(event) => {
                        let frame = DashboardMessage::Preview {
                            session_id: event.session_id,
                            lines: event.lines,
                        };
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("dashboard client lagged {} preview frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                if !pong_seen {
                    tracing::debug!("dashboard client missed pong, closing");
                    break;
                }
                pong_seen = false;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &DashboardMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

fn operation_error(operation: &str, session_id: &str) -> DashboardMessage {
    DashboardMessage::OperationError {
        operation: operation.to_string(),
        session_id: session_id.to_string(),
        error: "session not found".to_string(),
    }
}

/// Apply one dashboard operation; some produce a direct reply frame, the
/// rest surface through registry events.
async fn handle_request(
    state: &DashboardState,
    request: DashboardRequest,
) -> Option<DashboardMessage> {
    match request {
        DashboardRequest::StopSession { session_id } => {
            let Some(session) = state.registry.get_by_id(&session_id).await else {
                return Some(operation_error("stop-session", &session_id));
            };
            // A delivered signal lets the session unregister itself on its
            // exit path; the registry keeps tracking it until it actually
            // stops serving. If the process is already gone the signal
            // fails and the session is simply unregistered.
            if !terminate(session.pid) {
                tracing::debug!("stop: pid {} already gone, unregistering", session.pid);
                let _ = state.registry.unregister(&session_id).await;
            }
            None
        }
        DashboardRequest::RenameSession { session_id, name } => {
            let name = name.trim();
            if name.is_empty() {
                return Some(DashboardMessage::OperationError {
                    operation: "rename-session".to_string(),
                    session_id,
                    error: "name must not be empty".to_string(),
                });
            }
            match state.registry.rename(&session_id, name).await {
                Ok(_) => None,
                Err(_) => Some(operation_error("rename-session", &session_id)),
            }
        }
        DashboardRequest::GetMetadata { session_id } => {
            match collect_metadata(&state.registry, &session_id).await {
                Some(metadata) => Some(DashboardMessage::Metadata {
                    session_id,
                    metadata,
                }),
                None => Some(operation_error("get-metadata", &session_id)),
            }
        }
        DashboardRequest::ClearAttention { session_id } => {
            let Some(session) = state.registry.get_by_id(&session_id).await else {
                return Some(operation_error("clear-attention", &session_id));
            };
            if session.status == SessionStatus::Attention {
                let _ = state
                    .registry
                    .update_status(&session_id, SessionStatus::Active)
                    .await;
            }
            None
        }
    }
}
