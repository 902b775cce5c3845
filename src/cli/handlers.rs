//! Command handlers: the session runtime and the out-of-band hub commands.

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::commands::Cli;
use crate::client::{ensure_hub, spawn_heartbeat, HubClient};
use crate::core::config::{Config, HubState, NetworkingMode, SESSION_PORT_START};
use crate::core::pty::{PtyProcess, DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS};
use crate::core::session::SessionRegistration;
use crate::core::token::generate_token;
use crate::hub::process::terminate;
use crate::server::static_files::{terminal_assets, AssetCache};
use crate::server::{bind_scanning, pump_output, Fanout, SessionState};

/// Wrap an agent in a PTY, serve it, register with the hub, and bridge the
/// host terminal until the agent exits. Returns the process exit code to
/// propagate.
pub async fn run_session(cli: Cli, config: Config) -> Result<i32> {
    let (agent_cmd, agent_args) = resolve_agent(&cli.agent);
    let agent_display = agent_cmd
        .rsplit(std::path::MAIN_SEPARATOR)
        .next()
        .unwrap_or(&agent_cmd)
        .to_string();

    let mode = if cli.tailscale {
        NetworkingMode::Tailscale
    } else if cli.local {
        NetworkingMode::Local
    } else {
        config.networking_mode
    };
    tracing::debug!("networking mode: {:?}", mode);

    let host = if cli.localhost { "127.0.0.1" } else { "0.0.0.0" };
    let (cols, rows) =
        crossterm::terminal::size().unwrap_or((DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS));

    let token = generate_token();
    let (pty, output_rx, mut exit_rx) = PtyProcess::spawn(&agent_cmd, &agent_args, cols, rows)?;
    let pty = Arc::new(pty);

    let (listener, port) = bind_scanning(host, cli.port.unwrap_or(SESSION_PORT_START))
        .await
        .context("binding session server")?;

    let fanout = Arc::new(Fanout::new());
    crate::server::session::spawn_server(
        listener,
        SessionState {
            token: Arc::new(token.clone()),
            pty: pty.clone(),
            fanout: fanout.clone(),
            assets: Arc::new(AssetCache::new(terminal_assets())),
        },
    );
    tokio::spawn(pump_output(output_rx, fanout.clone(), true));

    // Hub registration is best-effort; the session serves its own clients
    // either way.
    let hub = ensure_hub().await;
    let mut session_id = None;
    let mut heartbeat = None;
    if let Some(client) = &hub {
        let registration = SessionRegistration {
            name: cli.name.clone().unwrap_or_else(|| "agent".to_string()),
            port,
            token: token.clone(),
            agent: agent_display.clone(),
            cwd: std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            pid: pty.pid(),
        };
        match client.register(&registration).await {
            Ok(info) => {
                tracing::info!("registered with hub as {}", info.id);
                heartbeat = Some(spawn_heartbeat(client.clone(), info.id.clone()));
                session_id = Some(info.id);
            }
            Err(e) => tracing::warn!("hub registration failed, continuing standalone: {}", e),
        }
    }

    let display_ip = if cli.localhost {
        "127.0.0.1".to_string()
    } else {
        local_ip().unwrap_or_else(|| "localhost".to_string())
    };
    print_urls(&display_ip, port, &token, session_id.is_some());

    crossterm::terminal::enable_raw_mode().context("entering raw mode")?;
    spawn_stdin_bridge(pty.clone());
    spawn_resize_watch(pty.clone(), fanout.clone());

    let agent_exit = tokio::select! {
        code = &mut exit_rx => Some(code.unwrap_or(1)),
        _ = crate::hub::daemon::shutdown_signal() => None,
    };
    let exit_code = match agent_exit {
        Some(code) => code,
        None => {
            tracing::info!("shutdown signal, stopping agent");
            pty.kill();
            // Give the agent a moment to exit so the code is its own.
            tokio::time::timeout(std::time::Duration::from_secs(2), exit_rx)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or(0)
        }
    };

    let _ = crossterm::terminal::disable_raw_mode();
    if let Some(task) = heartbeat {
        task.abort();
    }
    if let (Some(client), Some(id)) = (hub.as_ref(), session_id.as_ref()) {
        client.unregister(id).await;
    }
    pty.kill();

    println!();
    tracing::info!("agent exited with code {}", exit_code);
    Ok(exit_code)
}

fn resolve_agent(args: &[String]) -> (String, Vec<String>) {
    match args.split_first() {
        Some((cmd, rest)) => (cmd.clone(), rest.to_vec()),
        None => {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            (shell, Vec::new())
        }
    }
}

fn print_urls(ip: &str, port: u16, token: &str, registered: bool) {
    println!();
    println!("  📱 Session:   http://{}:{}?token={}", ip, port, token);
    if registered {
        if let Some(hub) = HubState::load() {
            println!(
                "  🗂  Dashboard: http://{}:{}?token={}",
                ip, hub.external_port, hub.master_token
            );
        }
    } else {
        println!("  ⚠️  No hub available - running standalone, dashboard disabled");
    }
    println!();
}

/// Forward host terminal keystrokes into the PTY. Runs on a plain thread:
/// stdin reads block and must not tie up the runtime.
fn spawn_stdin_bridge(pty: Arc<PtyProcess>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => pty.write(&buf[..n]),
            }
        }
    });
}

/// Track host terminal resizes: apply them to the PTY and tell every remote
/// client so their view matches the host dimensions.
#[cfg(unix)]
fn spawn_resize_watch(pty: Arc<PtyProcess>, fanout: Arc<Fanout>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut winch) = signal(SignalKind::window_change()) else {
            return;
        };
        while winch.recv().await.is_some() {
            if let Ok((cols, rows)) = crossterm::terminal::size() {
                pty.resize(cols, rows);
                fanout.broadcast_resize(cols, rows);
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_resize_watch(_pty: Arc<PtyProcess>, _fanout: Arc<Fanout>) {}

/// Best-effort LAN address for printed URLs: route a UDP socket outward and
/// read the chosen local address. No packet is sent.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

pub fn setup(config: &Config) -> Result<()> {
    config.save()?;
    println!(
        "Config written to {}",
        crate::core::config::config_dir().join("config.json").display()
    );
    println!("Networking mode: {:?}", config.networking_mode);
    Ok(())
}

pub fn hub_info() {
    match HubState::load() {
        Some(hub) => {
            println!("Hub pid:       {}", hub.pid);
            println!("Internal API:  http://127.0.0.1:{}", hub.internal_port);
            let ip = local_ip().unwrap_or_else(|| "localhost".to_string());
            println!(
                "Dashboard:     http://{}:{}?token={}",
                ip, hub.external_port, hub.master_token
            );
        }
        None => println!("No hub running."),
    }
}

pub async fn hub_status() {
    let Some(hub) = HubState::load() else {
        println!("No hub running.");
        return;
    };
    let client = HubClient::new(hub.internal_port);
    match client.health().await {
        Some(health) => {
            println!(
                "Hub up (pid {}), {} session(s), uptime {}s",
                hub.pid, health.sessions, health.uptime
            );
            if let Ok(sessions) = client.list_sessions().await {
                for session in sessions {
                    println!(
                        "  {}  {:10}  {:9?}  :{}  {}",
                        session.id, session.name, session.status, session.port, session.cwd
                    );
                }
            }
        }
        None => println!("Hub state file exists (pid {}) but it is not answering.", hub.pid),
    }
}

pub fn hub_stop() {
    match HubState::load() {
        Some(hub) => {
            if terminate(hub.pid) {
                println!("Stop signal sent to hub (pid {}).", hub.pid);
            } else {
                println!("Hub (pid {}) is already gone; cleaning up state files.", hub.pid);
                HubState::remove();
            }
        }
        None => println!("No hub running."),
    }
}
