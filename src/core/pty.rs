use std::io::{Read, Write};
use std::sync::Mutex;

use anyhow::Result;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use tokio::sync::{mpsc, oneshot};

/// Default PTY dimensions when the host terminal size is unknown.
pub const DEFAULT_PTY_COLS: u16 = 80;
pub const DEFAULT_PTY_ROWS: u16 = 24;

/// Handle to a spawned agent process wrapped in a pseudo-terminal.
///
/// The only platform-specific piece of the system lives here; everything
/// above it deals in byte streams.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: u32,
}

impl PtyProcess {
    /// Spawn `agent args...` under a new PTY of the given size.
    ///
    /// Returns the process handle, the raw output stream, and a one-shot
    /// exit notification carrying the child's exit code.
    pub fn spawn(
        agent: &str,
        args: &[String],
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>, oneshot::Receiver<i32>)> {
        let pty_system = NativePtySystem::default();
        let pty_pair = pty_system.openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(agent);
        for arg in args {
            cmd.arg(arg);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        #[cfg(not(windows))]
        {
            cmd.env("TERM", "xterm-256color");
            cmd.env("COLORTERM", "truecolor");
        }

        tracing::info!("spawning agent: {} {:?}", agent, args);
        let mut child = pty_pair.slave.spawn_command(cmd)?;
        let pid = child.process_id().unwrap_or(0);
        let killer = child.clone_killer();

        let mut reader = pty_pair.master.try_clone_reader()?;
        let writer = pty_pair.master.take_writer()?;

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::Interrupted
                            || e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!("pty read ended: {}", e);
                        break;
                    }
                }
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::warn!("waiting for agent failed: {}", e);
                    1
                }
            };
            let _ = exit_tx.send(code);
        });

        let process = PtyProcess {
            master: Mutex::new(pty_pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            pid,
        };
        Ok((process, output_rx, exit_rx))
    }

    /// Unbuffered write into the PTY. A no-op once the child has exited.
    pub fn write(&self, bytes: &[u8]) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writer.write_all(bytes).and_then(|_| writer.flush()) {
                tracing::debug!("pty write dropped: {}", e);
            }
        }
    }

    /// Resize the PTY. Non-fatal if the child has already exited.
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Ok(master) = self.master.lock() {
            let size = PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            };
            if let Err(e) = master.resize(size) {
                tracing::debug!("pty resize ignored: {}", e);
            }
        }
    }

    /// OS process id of the agent, fixed at spawn.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Terminate the child. Idempotent; errors from an already-dead child
    /// are ignored.
    pub fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }
}
