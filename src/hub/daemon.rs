//! Hub daemon runtime.
//!
//! Binding the loopback control port is the singleton election: the first
//! hub to bind wins, later starters see its health endpoint and defer. Once
//! both listeners are up and the state files are written, the readiness
//! line goes to stdout and the spawning CLI stops watching. The hub exits
//! 30 seconds after its registry empties, or on a termination signal, and
//! removes its state files on the way out.

use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::core::config::{HubState, DASHBOARD_PORT, INTERNAL_PORT};
use crate::core::session::now_ms;
use crate::core::token::generate_token;
use crate::hub::dashboard::{self, DashboardState};
use crate::hub::internal_api::{self, InternalApiState};
use crate::hub::preview::PreviewCollector;
use crate::hub::rate_limit::RateLimiter;
use crate::hub::registry::RegistryHandle;
use crate::server::static_files::{dashboard_assets, AssetCache};

/// How long the hub lingers after the last session unregisters.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Registry health-check period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

pub async fn run_hub() -> Result<()> {
    let started = Instant::now();

    let internal_listener = TcpListener::bind(("127.0.0.1", INTERNAL_PORT))
        .await
        .context("internal port in use (is another hub already running?)")?;
    let external_listener = TcpListener::bind(("0.0.0.0", DASHBOARD_PORT))
        .await
        .context("dashboard port in use")?;

    let master_token = generate_token();
    let registry = RegistryHandle::new();
    let collector = PreviewCollector::new(registry.clone());
    tokio::spawn(collector.clone().run());

    let state = HubState {
        master_token: master_token.clone(),
        external_port: DASHBOARD_PORT,
        internal_port: INTERNAL_PORT,
        pid: std::process::id(),
        started_at: now_ms(),
    };
    state.write()?;

    // Readiness contract: exactly this line, once both sockets are bound
    // and the state files exist. Stdout is ignored afterwards.
    println!("hub:ready:{}", INTERNAL_PORT);
    let _ = std::io::stdout().flush();
    tracing::info!(
        "hub ready: dashboard on :{}, control api on 127.0.0.1:{}",
        DASHBOARD_PORT,
        INTERNAL_PORT
    );

    let api = internal_api::router(InternalApiState {
        registry: registry.clone(),
        started,
    });
    tokio::spawn(async move {
        if let Err(e) = axum::serve(internal_listener, api).await {
            tracing::error!("internal api stopped: {}", e);
        }
    });

    let dashboard_state = DashboardState {
        registry: registry.clone(),
        master_token: Arc::new(master_token),
        rate_limiter: Arc::new(RateLimiter::new()),
        collector,
        assets: Arc::new(AssetCache::new(dashboard_assets())),
    };
    let dashboard_app = dashboard::router(dashboard_state)
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(external_listener, dashboard_app).await {
            tracing::error!("dashboard server stopped: {}", e);
        }
    });

    let sweep_registry = registry.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_registry.sweep().await;
        }
    });

    let (signal_tx, mut signal_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });

    // Auto-shutdown: armed whenever the registry is empty, including at
    // start, so a hub whose spawning session never registers still exits.
    let mut events = registry.subscribe();
    let mut grace: Option<Pin<Box<tokio::time::Sleep>>> =
        Some(Box::pin(tokio::time::sleep(SHUTDOWN_GRACE)));

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(_) => {
                        if registry.size().await == 0 {
                            if grace.is_none() {
                                tracing::info!("registry empty, shutdown in {:?}", SHUTDOWN_GRACE);
                                grace = Some(Box::pin(tokio::time::sleep(SHUTDOWN_GRACE)));
                            }
                        } else {
                            grace = None;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Catch up and re-evaluate on the next event.
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = async {
                if let Some(timer) = grace.as_mut() {
                    timer.await
                }
            }, if grace.is_some() => {
                tracing::info!("no sessions for {:?}, shutting down", SHUTDOWN_GRACE);
                break;
            }
            _ = &mut signal_rx => {
                tracing::info!("termination signal, shutting down");
                break;
            }
        }
    }

    HubState::remove();
    Ok(())
}

/// Completes on SIGINT or SIGTERM. Shared with the session runtime, which
/// has the same two exit signals to watch.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
