//! Session-side hub client.
//!
//! Probes for a live hub, spawns one detached when none answers, and keeps
//! the registration alive with heartbeats. Every call is best-effort with a
//! hard timeout: the hub being unreachable must never cost the session its
//! own clients.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::config::INTERNAL_PORT;
use crate::core::session::{SessionInfo, SessionRegistration};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(3);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to watch a freshly spawned hub for its readiness line.
const SPAWN_WAIT: Duration = Duration::from_secs(10);
/// Heartbeat period; the hub trusts heartbeats younger than twice this.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct HubHealth {
    pub status: String,
    pub sessions: usize,
    pub uptime: u64,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    session: SessionInfo,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone)]
pub struct HubClient {
    base_url: String,
    client: Client,
}

impl HubClient {
    pub fn new(internal_port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", internal_port),
            client: Client::new(),
        }
    }

    /// Liveness probe. `None` means no hub (or not answering in time).
    pub async fn health(&self) -> Option<HubHealth> {
        self.client
            .get(format!("{}/api/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()
    }

    pub async fn register(&self, registration: &SessionRegistration) -> Result<SessionInfo> {
        let response = self
            .client
            .post(format!("{}/api/sessions", self.base_url))
            .timeout(REGISTER_TIMEOUT)
            .json(registration)
            .send()
            .await
            .context("registering with hub")?;
        if !response.status().is_success() {
            return Err(anyhow!("hub rejected registration: {}", response.status()));
        }
        let body: RegisterResponse = response.json().await?;
        Ok(body.session)
    }

    /// Errors are swallowed; a missed heartbeat is recovered by the next.
    pub async fn heartbeat(&self, id: &str) {
        let result = self
            .client
            .put(format!("{}/api/sessions/{}/heartbeat", self.base_url, id))
            .timeout(HEARTBEAT_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!("heartbeat failed: {}", e);
        }
    }

    /// Best-effort removal on the way out.
    pub async fn unregister(&self, id: &str) {
        let result = self
            .client
            .delete(format!("{}/api/sessions/{}", self.base_url, id))
            .timeout(UNREGISTER_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!("unregister failed: {}", e);
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let body: SessionsResponse = self
            .client
            .get(format!("{}/api/sessions", self.base_url))
            .timeout(UNREGISTER_TIMEOUT)
            .send()
            .await?
            .json()
            .await?;
        Ok(body.sessions)
    }
}

/// Find a live hub or start one. `None` puts the session in standalone
/// mode; that is a warning, not an error.
pub async fn ensure_hub() -> Option<HubClient> {
    let client = HubClient::new(INTERNAL_PORT);
    if client.health().await.is_some() {
        return Some(client);
    }

    tracing::info!("no hub answering, starting one");
    if let Err(e) = spawn_hub().await {
        tracing::warn!("could not start hub: {}", e);
        return None;
    }
    if client.health().await.is_some() {
        Some(client)
    } else {
        tracing::warn!("hub started but does not answer health checks");
        None
    }
}

/// Spawn `itwillsync hub run` detached and wait for its readiness line.
async fn spawn_hub() -> Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let mut cmd = tokio::process::Command::new(exe);
    cmd.args(["hub", "run"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().context("spawning hub")?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("hub stdout not captured"))?;

    // Reap the detached child whenever it eventually exits.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let mut lines = BufReader::new(stdout).lines();
    let became_ready = tokio::time::timeout(SPAWN_WAIT, async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.starts_with("hub:ready:") {
                return true;
            }
        }
        false
    })
    .await;

    match became_ready {
        Ok(true) => Ok(()),
        Ok(false) => Err(anyhow!("hub exited before becoming ready")),
        Err(_) => Err(anyhow!("hub not ready within {:?}", SPAWN_WAIT)),
    }
}

/// Periodic heartbeat task for a registered session.
pub fn spawn_heartbeat(client: HubClient, session_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            client.heartbeat(&session_id).await;
        }
    })
}
