//! Per-session HTTP + WebSocket server.
//!
//! Serves the bundled terminal page, authenticates WebSocket upgrades with
//! the session token, fans PTY output out to every connected client, and
//! applies client input/resizes to the PTY. Clients get a writer mailbox
//! each; a client that cannot keep up is disconnected instead of slowing
//! the forwarder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::core::protocol::{ClientMessage, ServerMessage};
use crate::core::pty::PtyProcess;
use crate::core::scrollback::{ScrollbackBuffer, Utf8Carry};
use crate::core::token::constant_time_eq;
use crate::server::static_files::{accepts_gzip, AssetCache};

/// Per-client outbound queue depth. Overflow disconnects the client.
const CLIENT_QUEUE: usize = 256;
/// How long a fresh connection may stay silent before it is synced with a
/// full snapshot instead of a resume delta.
const RESUME_GRACE: Duration = Duration::from_millis(250);
/// WebSocket keepalive ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state behind the session router.
#[derive(Clone)]
pub struct SessionState {
    pub token: Arc<String>,
    pub pty: Arc<PtyProcess>,
    pub fanout: Arc<Fanout>,
    pub assets: Arc<AssetCache>,
}

/// Scrollback plus the set of connected client mailboxes, under one lock so
/// snapshots and live frames can never interleave.
pub struct Fanout {
    inner: Mutex<FanoutInner>,
}

struct FanoutInner {
    scrollback: ScrollbackBuffer,
    clients: HashMap<u64, mpsc::Sender<ServerMessage>>,
    next_id: u64,
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

impl Fanout {
    pub fn new() -> Self {
        Fanout {
            inner: Mutex::new(FanoutInner {
                scrollback: ScrollbackBuffer::default(),
                clients: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Append PTY output to scrollback and deliver it to every client.
    pub fn push_output(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let seq = inner.scrollback.push(text);
        let frame = ServerMessage::Data {
            data: text.to_string(),
            seq,
        };
        Self::broadcast(&mut inner, frame);
    }

    /// Tell every client the host PTY dimensions changed.
    pub fn broadcast_resize(&self, cols: u16, rows: u16) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        Self::broadcast(&mut inner, ServerMessage::Resize { cols, rows });
    }

    fn broadcast(inner: &mut FanoutInner, frame: ServerMessage) {
        let mut dead = Vec::new();
        for (&id, tx) in inner.clients.iter() {
            if tx.try_send(frame.clone()).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            tracing::debug!("dropping client {} (queue overflow or gone)", id);
            inner.clients.remove(&id);
        }
    }

    /// Register a fresh client: it receives the entire current scrollback as
    /// one frame before any live frame.
    pub fn join_snapshot(&self, tx: mpsc::Sender<ServerMessage>) -> u64 {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let (data, seq) = inner.scrollback.snapshot();
        let _ = tx.try_send(ServerMessage::Data { data, seq });
        Self::register(&mut inner, tx)
    }

    /// Register a resuming client: it receives exactly the output after
    /// `last_seq` (or whatever survives trimming) before any live frame.
    pub fn join_resume(&self, tx: mpsc::Sender<ServerMessage>, last_seq: u64) -> u64 {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let (data, seq) = inner.scrollback.since(last_seq);
        let _ = tx.try_send(ServerMessage::Data { data, seq });
        Self::register(&mut inner, tx)
    }

    /// A mid-stream resume request from an already-registered client.
    pub fn send_resume(&self, client_id: u64, last_seq: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let (data, seq) = inner.scrollback.since(last_seq);
        if let Some(tx) = inner.clients.get(&client_id) {
            if tx.try_send(ServerMessage::Data { data, seq }).is_err() {
                inner.clients.remove(&client_id);
            }
        }
    }

    fn register(inner: &mut FanoutInner, tx: mpsc::Sender<ServerMessage>) -> u64 {
        inner.next_id += 1;
        let id = inner.next_id;
        inner.clients.insert(id, tx);
        id
    }

    pub fn leave(&self, client_id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.clients.remove(&client_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.clients.len()).unwrap_or(0)
    }
}

/// Bind the session listener, scanning upward from `start_port` until a
/// port is free.
pub async fn bind_scanning(host: &str, start_port: u16) -> Result<(TcpListener, u16)> {
    for port in start_port..start_port.saturating_add(200) {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }
    Err(anyhow!(
        "no free port in {}..{}",
        start_port,
        start_port.saturating_add(200)
    ))
}

/// Build the session router and serve it on `listener`.
pub fn spawn_server(listener: TcpListener, state: SessionState) {
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/*path", get(asset_handler))
        .layer(
            ServiceBuilder::new().layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("session server stopped: {}", e);
        }
    });
}

/// `/` serves the terminal page over plain GET and the session stream over
/// a WebSocket upgrade; the upgrade requires the session token.
async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<SessionState>,
) -> Response {
    match ws {
        Some(upgrade) => {
            let supplied = params.get("token").map(String::as_str).unwrap_or("");
            if !constant_time_eq(supplied.as_bytes(), state.token.as_bytes()) {
                tracing::warn!("websocket upgrade rejected: bad token");
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }
            upgrade.on_upgrade(move |socket| handle_socket(socket, state))
        }
        None => {
            let gzip_ok = accepts_gzip(&headers);
            state.assets.serve("/", gzip_ok).await
        }
    }
}

async fn asset_handler(
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
    State(state): State<SessionState>,
) -> Response {
    let gzip_ok = accepts_gzip(&headers);
    state.assets.serve(&format!("/{}", path), gzip_ok).await
}

async fn handle_socket(socket: WebSocket, state: SessionState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(CLIENT_QUEUE);
    let pong_seen = Arc::new(AtomicBool::new(true));

    // The first client message decides the sync mode: an immediate `resume`
    // gets a delta, anything else (or silence past the grace) gets the full
    // scrollback first. The fan-out map holds the only sender, so dropping
    // a client there closes its mailbox and tears the connection down.
    let first = tokio::time::timeout(RESUME_GRACE, stream.next()).await;
    let mut deferred = None;
    let client_id = match first {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Resume { last_seq }) => {
                    state.fanout.join_resume(tx, last_seq)
                }
                Ok(other) => {
                    let id = state.fanout.join_snapshot(tx);
                    deferred = Some(other);
                    id
                }
                Err(_) => state.fanout.join_snapshot(tx),
            }
        }
        Ok(Some(Ok(_))) | Err(_) => state.fanout.join_snapshot(tx),
        Ok(Some(Err(_))) | Ok(None) => return,
    };

    if let Some(msg) = deferred {
        apply_client_message(&state, client_id, msg);
    }

    // Writer: drains the mailbox and owns the keepalive.
    let writer_pong = pong_seen.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !writer_pong.swap(false, Ordering::SeqCst) {
                        tracing::debug!("client missed pong, closing");
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Reader: applies client frames until the socket closes.
    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(parsed) => apply_client_message(&state, client_id, parsed),
                            // Malformed frames are silently dropped.
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_seen.store(true, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = &mut writer => break,
        }
    }

    state.fanout.leave(client_id);
    writer.abort();
}

fn apply_client_message(state: &SessionState, client_id: u64, msg: ClientMessage) {
    match msg {
        ClientMessage::Input { data } => state.pty.write(data.as_bytes()),
        ClientMessage::Resize { cols, rows } => state.pty.resize(cols, rows),
        ClientMessage::Resume { last_seq } => state.fanout.send_resume(client_id, last_seq),
    }
}

/// Forward PTY output into the fan-out, optionally mirroring raw bytes to
/// the host terminal. Runs until the PTY stream ends.
pub async fn pump_output(
    mut output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    fanout: Arc<Fanout>,
    mirror_to_stdout: bool,
) {
    use tokio::io::AsyncWriteExt;

    let mut carry = Utf8Carry::new();
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = output_rx.recv().await {
        if mirror_to_stdout {
            let _ = stdout.write_all(&chunk).await;
            let _ = stdout.flush().await;
        }
        let text = carry.push(&chunk);
        fanout.push_output(&text);
    }
}
