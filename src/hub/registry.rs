//! Session registry actor.
//!
//! Single owner of all session state in the hub. Commands arrive over an
//! mpsc channel and are processed sequentially; every mutation emits a
//! registry event on a broadcast channel, in mutation order. Replaying the
//! event stream reconstructs the registry contents exactly.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::core::session::{now_ms, SessionInfo, SessionRegistration, SessionStatus};
use crate::core::token::generate_session_id;
use crate::hub::process::process_alive;

/// Heartbeats younger than this prove liveness without a process probe.
const HEARTBEAT_TRUST_MS: u64 = 20_000;
/// Silence beyond this moves an active session to idle.
const IDLE_AFTER_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(SessionInfo),
    Removed { id: String },
    Updated(SessionInfo),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("registry unavailable")]
    ChannelClosed,
}

enum RegistryCommand {
    Register {
        registration: SessionRegistration,
        respond_to: oneshot::Sender<SessionInfo>,
    },
    Unregister {
        id: String,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },
    Rename {
        id: String,
        name: String,
        respond_to: oneshot::Sender<Result<SessionInfo, RegistryError>>,
    },
    UpdateStatus {
        id: String,
        status: SessionStatus,
        respond_to: oneshot::Sender<Result<SessionInfo, RegistryError>>,
    },
    Heartbeat {
        id: String,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },
    GetAll {
        respond_to: oneshot::Sender<Vec<SessionInfo>>,
    },
    GetById {
        id: String,
        respond_to: oneshot::Sender<Option<SessionInfo>>,
    },
    Size {
        respond_to: oneshot::Sender<usize>,
    },
    Sweep {
        respond_to: oneshot::Sender<()>,
    },
    #[cfg(test)]
    ForceLastSeen {
        id: String,
        last_seen: u64,
        respond_to: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle for talking to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    command_tx: mpsc::UnboundedSender<RegistryCommand>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl RegistryHandle {
    pub fn new() -> Self {
        Self::with_probe(process_alive)
    }

    /// Construct with a custom process-liveness probe (tests simulate dead
    /// agents this way).
    pub fn with_probe(probe: fn(u32) -> bool) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);

        let actor = RegistryActor {
            sessions: HashMap::new(),
            command_rx,
            event_tx: event_tx.clone(),
            probe,
        };
        tokio::spawn(actor.run());

        Self {
            command_tx,
            event_tx,
        }
    }

    /// Subscribe to registry events. Events are delivered in mutation order.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub async fn register(&self, registration: SessionRegistration) -> Result<SessionInfo, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::Register {
                registration,
                respond_to: tx,
            })
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::Unregister {
                id: id.to_string(),
                respond_to: tx,
            })
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<SessionInfo, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::Rename {
                id: id.to_string(),
                name: name.to_string(),
                respond_to: tx,
            })
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<SessionInfo, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::UpdateStatus {
                id: id.to_string(),
                status,
                respond_to: tx,
            })
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Refresh `lastSeen`; an idle session becomes active again.
    pub async fn heartbeat(&self, id: &str) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::Heartbeat {
                id: id.to_string(),
                respond_to: tx,
            })
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    pub async fn get_all(&self) -> Vec<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RegistryCommand::GetAll { respond_to: tx })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RegistryCommand::GetById {
                id: id.to_string(),
                respond_to: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RegistryCommand::Size { respond_to: tx })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Run one health-check pass: trust recent heartbeats, probe the rest,
    /// idle out the silent, remove the dead.
    pub async fn sweep(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RegistryCommand::Sweep { respond_to: tx })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    #[cfg(test)]
    async fn force_last_seen(&self, id: &str, last_seen: u64) {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RegistryCommand::ForceLastSeen {
                id: id.to_string(),
                last_seen,
                respond_to: tx,
            })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

impl Default for RegistryHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct RegistryActor {
    sessions: HashMap<String, SessionInfo>,
    command_rx: mpsc::UnboundedReceiver<RegistryCommand>,
    event_tx: broadcast::Sender<RegistryEvent>,
    probe: fn(u32) -> bool,
}

impl RegistryActor {
    async fn run(mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            self.handle(cmd);
        }
        tracing::debug!("registry actor stopped ({} sessions)", self.sessions.len());
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine; the daemon may not have attached yet.
        let _ = self.event_tx.send(event);
    }

    fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                registration,
                respond_to,
            } => {
                let mut id = generate_session_id();
                while self.sessions.contains_key(&id) {
                    id = generate_session_id();
                }
                let now = now_ms();
                let info = SessionInfo {
                    id: id.clone(),
                    name: registration.name,
                    port: registration.port,
                    token: registration.token,
                    agent: registration.agent,
                    cwd: registration.cwd,
                    pid: registration.pid,
                    connected_at: now,
                    last_seen: now,
                    status: SessionStatus::Active,
                };
                self.sessions.insert(id, info.clone());
                tracing::info!("session registered: {} ({})", info.name, info.id);
                self.emit(RegistryEvent::Added(info.clone()));
                let _ = respond_to.send(info);
            }
            RegistryCommand::Unregister { id, respond_to } => {
                let result = if self.sessions.remove(&id).is_some() {
                    tracing::info!("session unregistered: {}", id);
                    self.emit(RegistryEvent::Removed { id });
                    Ok(())
                } else {
                    Err(RegistryError::NotFound(id))
                };
                let _ = respond_to.send(result);
            }
            RegistryCommand::Rename {
                id,
                name,
                respond_to,
            } => {
                let result = match self.sessions.get_mut(&id) {
                    Some(info) => {
                        info.name = name;
                        let info = info.clone();
                        self.emit(RegistryEvent::Updated(info.clone()));
                        Ok(info)
                    }
                    None => Err(RegistryError::NotFound(id)),
                };
                let _ = respond_to.send(result);
            }
            RegistryCommand::UpdateStatus {
                id,
                status,
                respond_to,
            } => {
                let result = match self.sessions.get_mut(&id) {
                    Some(info) => {
                        if info.status != status {
                            info.status = status;
                            let info = info.clone();
                            self.emit(RegistryEvent::Updated(info.clone()));
                            Ok(info)
                        } else {
                            Ok(info.clone())
                        }
                    }
                    None => Err(RegistryError::NotFound(id)),
                };
                let _ = respond_to.send(result);
            }
            RegistryCommand::Heartbeat { id, respond_to } => {
                let result = match self.sessions.get_mut(&id) {
                    Some(info) => {
                        info.last_seen = info.last_seen.max(now_ms());
                        if info.status == SessionStatus::Idle {
                            info.status = SessionStatus::Active;
                        }
                        let info = info.clone();
                        self.emit(RegistryEvent::Updated(info));
                        Ok(())
                    }
                    None => Err(RegistryError::NotFound(id)),
                };
                let _ = respond_to.send(result);
            }
            RegistryCommand::GetAll { respond_to } => {
                let mut sessions: Vec<SessionInfo> = self.sessions.values().cloned().collect();
                sessions.sort_by_key(|s| s.connected_at);
                let _ = respond_to.send(sessions);
            }
            RegistryCommand::GetById { id, respond_to } => {
                let _ = respond_to.send(self.sessions.get(&id).cloned());
            }
            RegistryCommand::Size { respond_to } => {
                let _ = respond_to.send(self.sessions.len());
            }
            RegistryCommand::Sweep { respond_to } => {
                self.sweep();
                let _ = respond_to.send(());
            }
            #[cfg(test)]
            RegistryCommand::ForceLastSeen {
                id,
                last_seen,
                respond_to,
            } => {
                if let Some(info) = self.sessions.get_mut(&id) {
                    info.last_seen = last_seen;
                }
                let _ = respond_to.send(());
            }
        }
    }

    /// One health-check pass. A recent heartbeat is a positive liveness
    /// proof even where a process probe would lie (permission boundaries),
    /// so the probe only runs for silent sessions.
    fn sweep(&mut self) {
        let now = now_ms();
        let mut removed = Vec::new();
        let mut idled = Vec::new();

        for info in self.sessions.values_mut() {
            let elapsed = now.saturating_sub(info.last_seen);
            if elapsed <= HEARTBEAT_TRUST_MS {
                continue;
            }
            if (self.probe)(info.pid) {
                if elapsed > IDLE_AFTER_MS && info.status == SessionStatus::Active {
                    info.status = SessionStatus::Idle;
                    idled.push(info.clone());
                }
            } else {
                removed.push(info.id.clone());
            }
        }

        for info in idled {
            tracing::debug!("session idle: {}", info.id);
            self.emit(RegistryEvent::Updated(info));
        }
        for id in removed {
            self.sessions.remove(&id);
            tracing::info!("session removed by health check: {}", id);
            self.emit(RegistryEvent::Removed { id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str) -> SessionRegistration {
        SessionRegistration {
            name: name.to_string(),
            port: 7964,
            token: "f".repeat(64),
            agent: "claude".into(),
            cwd: "/tmp".into(),
            pid: std::process::id(),
        }
    }

    #[tokio::test]
    async fn register_then_get_by_id_round_trips() {
        let registry = RegistryHandle::new();
        let info = registry.register(registration("one")).await.unwrap();
        assert_eq!(info.id.len(), 16);
        assert_eq!(info.status, SessionStatus::Active);

        let fetched = registry.get_by_id(&info.id).await.unwrap();
        assert_eq!(fetched.name, "one");
        assert_eq!(registry.size().await, 1);
    }

    #[tokio::test]
    async fn rename_is_visible_and_emits_update() {
        let registry = RegistryHandle::new();
        let info = registry.register(registration("old")).await.unwrap();
        let mut events = registry.subscribe();

        let renamed = registry.rename(&info.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(registry.get_by_id(&info.id).await.unwrap().name, "new");

        match events.recv().await.unwrap() {
            RegistryEvent::Updated(s) => assert_eq!(s.name, "new"),
            other => panic!("expected update event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unregister_emits_exactly_one_removed_event() {
        let registry = RegistryHandle::new();
        let info = registry.register(registration("gone")).await.unwrap();
        let mut events = registry.subscribe();

        registry.unregister(&info.id).await.unwrap();
        assert!(registry.get_by_id(&info.id).await.is_none());
        match events.recv().await.unwrap() {
            RegistryEvent::Removed { id } => assert_eq!(id, info.id),
            other => panic!("expected removed event, got {:?}", other),
        }
        assert!(registry.unregister(&info.id).await.is_err());
    }

    #[tokio::test]
    async fn status_update_only_emits_on_change() {
        let registry = RegistryHandle::new();
        let info = registry.register(registration("s")).await.unwrap();
        let mut events = registry.subscribe();

        registry
            .update_status(&info.id, SessionStatus::Attention)
            .await
            .unwrap();
        // Second identical update is idempotent.
        registry
            .update_status(&info.id, SessionStatus::Attention)
            .await
            .unwrap();
        registry
            .update_status(&info.id, SessionStatus::Active)
            .await
            .unwrap();

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, RegistryEvent::Updated(_)));
            updates += 1;
        }
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn sweep_trusts_recent_heartbeats_over_the_probe() {
        fn never_alive(_pid: u32) -> bool {
            false
        }
        let registry = RegistryHandle::with_probe(never_alive);
        let info = registry.register(registration("fresh")).await.unwrap();

        // Heartbeat is fresh: the (lying) probe must not even run.
        registry.sweep().await;
        assert!(registry.get_by_id(&info.id).await.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_silent_sessions_with_dead_processes() {
        fn never_alive(_pid: u32) -> bool {
            false
        }
        let registry = RegistryHandle::with_probe(never_alive);
        let info = registry.register(registration("dead")).await.unwrap();
        registry
            .force_last_seen(&info.id, now_ms().saturating_sub(25_000))
            .await;

        registry.sweep().await;
        assert!(registry.get_by_id(&info.id).await.is_none());
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn sweep_idles_silent_sessions_with_live_processes() {
        fn always_alive(_pid: u32) -> bool {
            true
        }
        let registry = RegistryHandle::with_probe(always_alive);
        let info = registry.register(registration("quiet")).await.unwrap();
        registry
            .force_last_seen(&info.id, now_ms().saturating_sub(40_000))
            .await;

        registry.sweep().await;
        let session = registry.get_by_id(&info.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Idle);

        // A heartbeat brings it back to active.
        registry.heartbeat(&info.id).await.unwrap();
        let session = registry.get_by_id(&info.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn event_stream_replay_reconstructs_registry_state() {
        let registry = RegistryHandle::new();
        let mut events = registry.subscribe();

        let a = registry.register(registration("a")).await.unwrap();
        let b = registry.register(registration("b")).await.unwrap();
        registry.rename(&a.id, "a2").await.unwrap();
        registry.unregister(&b.id).await.unwrap();
        let c = registry.register(registration("c")).await.unwrap();

        // Replay the event stream into a shadow map.
        let mut shadow: HashMap<String, SessionInfo> = HashMap::new();
        while let Ok(event) = events.try_recv() {
            match event {
                RegistryEvent::Added(s) => {
                    shadow.insert(s.id.clone(), s);
                }
                RegistryEvent::Removed { id } => {
                    shadow.remove(&id);
                }
                RegistryEvent::Updated(s) => {
                    shadow.insert(s.id.clone(), s);
                }
            }
        }

        let live = registry.get_all().await;
        assert_eq!(shadow.len(), live.len());
        for session in live {
            let mirrored = shadow.get(&session.id).expect("missing from replay");
            assert_eq!(mirrored.name, session.name);
            assert_eq!(mirrored.status, session.status);
        }
        assert!(shadow.contains_key(&a.id));
        assert!(shadow.contains_key(&c.id));
    }
}
