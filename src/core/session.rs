use serde::{Deserialize, Serialize};

/// Activity state of a registered session as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Attention,
}

/// A session as the hub registry sees it. Owned by the registry; everything
/// handed out is a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// 16-hex id assigned by the registry, unique for the hub's lifetime.
    pub id: String,
    pub name: String,
    pub port: u16,
    /// 64-hex session token, opaque to the hub.
    pub token: String,
    pub agent: String,
    pub cwd: String,
    pub pid: u32,
    /// Millisecond timestamps.
    pub connected_at: u64,
    pub last_seen: u64,
    pub status: SessionStatus,
}

/// Registration body a session posts to the hub's internal API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRegistration {
    pub name: String,
    pub port: u16,
    pub token: String,
    pub agent: String,
    pub cwd: String,
    pub pid: u32,
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
