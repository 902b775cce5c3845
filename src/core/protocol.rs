//! Wire protocol frames. One JSON value per WebSocket text frame, tagged by
//! `type`. Unknown or malformed inbound frames are dropped by the servers,
//! so every enum here only needs the shapes it actually speaks.

use serde::{Deserialize, Serialize};

use super::session::SessionInfo;

/// Frames a terminal client sends to a session server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Keystrokes, forwarded byte-for-byte into the PTY.
    #[serde(rename = "input")]
    Input { data: String },
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
    /// Reconnect catch-up: the client names the last sequence number it saw.
    #[serde(rename = "resume")]
    Resume {
        #[serde(rename = "lastSeq")]
        last_seq: u64,
    },
}

/// Frames a session server sends to its terminal clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// PTY output. `seq` is the cumulative character count as of the end of
    /// this frame.
    #[serde(rename = "data")]
    Data { data: String, seq: u64 },
    /// Host PTY dimensions changed; remote terminals should match.
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
}

/// Session metadata served on demand (internal API and dashboard).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub uptime_ms: u64,
    /// Resident set size, best-effort; absent when the probe fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Frames the hub pushes to dashboard clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardMessage {
    /// Full session list, sent immediately on connect.
    #[serde(rename = "sessions")]
    Sessions { sessions: Vec<SessionInfo> },
    #[serde(rename = "session-added")]
    SessionAdded { session: SessionInfo },
    #[serde(rename = "session-removed")]
    SessionRemoved {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session-updated")]
    SessionUpdated { session: SessionInfo },
    /// Throttled plain-text tail of a session's output.
    #[serde(rename = "preview")]
    Preview {
        #[serde(rename = "sessionId")]
        session_id: String,
        lines: Vec<String>,
    },
    #[serde(rename = "metadata")]
    Metadata {
        #[serde(rename = "sessionId")]
        session_id: String,
        metadata: SessionMetadata,
    },
    #[serde(rename = "operation-error")]
    OperationError {
        operation: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
}

/// Operations a dashboard client sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardRequest {
    #[serde(rename = "stop-session")]
    StopSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "rename-session")]
    RenameSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        name: String,
    },
    #[serde(rename = "get-metadata")]
    GetMetadata {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "clear-attention")]
    ClearAttention {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}
