//! Preview collector.
//!
//! For every registered session the hub keeps one outbound WebSocket
//! connection to that session's public fan-out, as an ordinary read-only
//! client. Incoming output is scanned for attention signals, stripped to
//! plain text, folded into a five-line window, and rebroadcast to
//! dashboards at most twice a second per session.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::core::ansi::{contains_attention, strip_ansi};
use crate::core::protocol::ServerMessage;
use crate::core::session::{SessionInfo, SessionStatus};
use crate::hub::registry::{RegistryEvent, RegistryHandle};

/// Lines kept per session preview.
pub const PREVIEW_MAX_LINES: usize = 5;
/// Width cap per preview line, `...` included.
pub const PREVIEW_MAX_COLS: usize = 80;
/// Minimum spacing between preview emissions for one session.
const THROTTLE: Duration = Duration::from_millis(500);
/// Reconnect backoff bounds.
const RECONNECT_BASE_MS: f64 = 1000.0;
const RECONNECT_FACTOR: f64 = 1.5;
const RECONNECT_MAX_MS: f64 = 10_000.0;

#[derive(Debug, Clone)]
pub struct PreviewEvent {
    pub session_id: String,
    pub lines: Vec<String>,
}

pub struct PreviewCollector {
    registry: RegistryHandle,
    event_tx: broadcast::Sender<PreviewEvent>,
    buffers: Mutex<HashMap<String, Vec<String>>>,
    tails: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PreviewCollector {
    pub fn new(registry: RegistryHandle) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(128);
        Arc::new(Self {
            registry,
            event_tx,
            buffers: Mutex::new(HashMap::new()),
            tails: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreviewEvent> {
        self.event_tx.subscribe()
    }

    /// Current preview lines per session, for dashboard connect replay.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.buffers
            .lock()
            .map(|buffers| {
                buffers
                    .iter()
                    .filter(|(_, lines)| !lines.is_empty())
                    .map(|(id, lines)| (id.clone(), lines.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Follow registry membership: one tail task per live session.
    pub async fn run(self: Arc<Self>) {
        let mut events = self.registry.subscribe();
        for session in self.registry.get_all().await {
            self.spawn_tail(session);
        }

        loop {
            match events.recv().await {
                Ok(RegistryEvent::Added(session)) => self.spawn_tail(session),
                Ok(RegistryEvent::Removed { id }) => self.drop_tail(&id),
                Ok(RegistryEvent::Updated(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("preview collector lagged {} registry events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn spawn_tail(self: &Arc<Self>, session: SessionInfo) {
        let Ok(mut tails) = self.tails.lock() else {
            return;
        };
        if tails.contains_key(&session.id) {
            return;
        }
        let id = session.id.clone();
        let collector = self.clone();
        tails.insert(id, tokio::spawn(collector.tail_session(session)));
    }

    fn drop_tail(&self, id: &str) {
        if let Ok(mut tails) = self.tails.lock() {
            if let Some(task) = tails.remove(id) {
                task.abort();
            }
        }
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.remove(id);
        }
    }

    /// Connection loop for one session, including reconnect backoff.
    async fn tail_session(self: Arc<Self>, session: SessionInfo) {
        let url = format!(
            "ws://127.0.0.1:{}/?token={}",
            session.port, session.token
        );
        let mut attempt: u32 = 0;

        loop {
            match connect_async(&url).await {
                Ok((socket, _)) => {
                    attempt = 0;
                    tracing::debug!("preview connected to session {}", session.id);
                    self.consume_stream(&session.id, socket).await;
                }
                Err(e) => {
                    tracing::debug!("preview connect to {} failed: {}", session.id, e);
                }
            }

            // Only reconnect while the session is still registered.
            if self.registry.get_by_id(&session.id).await.is_none() {
                break;
            }
            tokio::time::sleep(reconnect_delay(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Read one established connection until it drops, folding `data`
    /// frames into the preview window.
    async fn consume_stream(
        &self,
        session_id: &str,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = socket.split();
        let mut lines: Vec<String> = Vec::new();
        let mut carry = String::new();
        let mut dirty = false;
        let mut throttle: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(ServerMessage::Data { data, .. }) =
                                serde_json::from_str::<ServerMessage>(&text)
                            else {
                                continue;
                            };
                            // Attention scan runs on the raw bytes, before
                            // anything is stripped.
                            if contains_attention(&data) {
                                let _ = self
                                    .registry
                                    .update_status(session_id, SessionStatus::Attention)
                                    .await;
                            }
                            append_preview_lines(&mut lines, &mut carry, &data);
                            dirty = true;
                            if throttle.is_none() {
                                throttle = Some(Box::pin(tokio::time::sleep(THROTTLE)));
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                _ = async {
                    if let Some(timer) = throttle.as_mut() {
                        timer.await
                    }
                }, if throttle.is_some() => {
                    throttle = None;
                    if dirty {
                        dirty = false;
                        self.emit(session_id, lines.clone());
                    }
                }
            }
        }

        // No flush on disconnect: the reconnect replays the session's
        // scrollback, which rebuilds the window within one throttle period.
    }

    fn emit(&self, session_id: &str, lines: Vec<String>) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.insert(session_id.to_string(), lines.clone());
        }
        let _ = self.event_tx.send(PreviewEvent {
            session_id: session_id.to_string(),
            lines,
        });
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let ms = (RECONNECT_BASE_MS * RECONNECT_FACTOR.powi(attempt as i32)).min(RECONNECT_MAX_MS);
    Duration::from_millis(ms as u64)
}

/// Fold a raw output chunk into the preview line window: strip control
/// sequences, assemble complete lines through the carry, trim, drop blanks,
/// cap the width, keep the last five.
pub fn append_preview_lines(lines: &mut Vec<String>, carry: &mut String, chunk: &str) {
    carry.push_str(&strip_ansi(chunk));
    if !carry.contains('\n') {
        return;
    }

    let text = std::mem::take(carry);
    let mut parts = text.split('\n').collect::<Vec<_>>();
    // The final fragment is incomplete (possibly empty) and becomes the new
    // carry.
    *carry = parts.pop().unwrap_or("").to_string();

    for part in parts {
        let line = part.trim_end();
        if line.is_empty() {
            continue;
        }
        let truncated = if line.chars().count() > PREVIEW_MAX_COLS {
            let head: String = line.chars().take(PREVIEW_MAX_COLS - 3).collect();
            format!("{head}...")
        } else {
            line.to_string()
        };
        lines.push(truncated);
        if lines.len() > PREVIEW_MAX_LINES {
            let excess = lines.len() - PREVIEW_MAX_LINES;
            lines.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_lines_across_chunks() {
        let mut lines = Vec::new();
        let mut carry = String::new();
        append_preview_lines(&mut lines, &mut carry, "hel");
        assert!(lines.is_empty());
        append_preview_lines(&mut lines, &mut carry, "lo\nwor");
        assert_eq!(lines, vec!["hello"]);
        assert_eq!(carry, "wor");
        append_preview_lines(&mut lines, &mut carry, "ld\n");
        assert_eq!(lines, vec!["hello", "world"]);
        assert_eq!(carry, "");
    }

    #[test]
    fn drops_blank_lines_and_trims_trailing_whitespace() {
        let mut lines = Vec::new();
        let mut carry = String::new();
        append_preview_lines(&mut lines, &mut carry, "a   \n\n  \nb\n");
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn keeps_only_the_last_five_lines() {
        let mut lines = Vec::new();
        let mut carry = String::new();
        append_preview_lines(&mut lines, &mut carry, "1\n2\n3\n4\n5\n6\n7\n");
        assert_eq!(lines, vec!["3", "4", "5", "6", "7"]);
    }

    #[test]
    fn truncates_wide_lines_to_eighty_chars() {
        let mut lines = Vec::new();
        let mut carry = String::new();
        let wide = "x".repeat(200);
        append_preview_lines(&mut lines, &mut carry, &format!("{wide}\n"));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].chars().count(), PREVIEW_MAX_COLS);
        assert!(lines[0].ends_with("..."));
    }

    #[test]
    fn strips_control_sequences_before_assembly() {
        let mut lines = Vec::new();
        let mut carry = String::new();
        append_preview_lines(
            &mut lines,
            &mut carry,
            "\x1b[32m$ cargo test\x1b[0m\r\n\x1b]0;title\x07ok\n",
        );
        assert_eq!(lines, vec!["$ cargo test", "ok"]);
    }

    #[test]
    fn reconnect_backoff_grows_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(1), Duration::from_millis(1500));
        assert_eq!(reconnect_delay(2), Duration::from_millis(2250));
        assert_eq!(reconnect_delay(20), Duration::from_millis(10_000));
    }
}
