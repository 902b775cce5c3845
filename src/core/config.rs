use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Externally reachable dashboard port.
pub const DASHBOARD_PORT: u16 = 7962;
/// Loopback-only hub control API port. Binding it is also the hub's
/// singleton election.
pub const INTERNAL_PORT: u16 = 7963;
/// First port tried for session servers; the scan moves upward from here.
pub const SESSION_PORT_START: u16 = 7964;

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "ITWILLSYNC_CONFIG_DIR";

const CONFIG_FILE: &str = "config.json";
const HUB_STATE_FILE: &str = "hub.json";
const HUB_PID_FILE: &str = "hub.pid";

/// Resolve the config directory: `$ITWILLSYNC_CONFIG_DIR` if set, else
/// `~/.itwillsync`. The directory is created on first write, not here.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".itwillsync"))
        .unwrap_or_else(|| PathBuf::from(".itwillsync"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkingMode {
    Local,
    Tailscale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub networking_mode: NetworkingMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            networking_mode: NetworkingMode::Local,
        }
    }
}

impl Config {
    /// Load the user config. A missing file or invalid JSON yields the
    /// default (`local`) rather than an error.
    pub fn load() -> Config {
        Self::load_from(&config_dir())
    }

    pub fn load_from(dir: &Path) -> Config {
        let path = dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_dir())
    }

    pub fn save_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config dir {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Hub runtime state, written at hub start and removed at shutdown. Sessions
/// and out-of-band CLI commands read it to find a live hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubState {
    pub master_token: String,
    pub external_port: u16,
    pub internal_port: u16,
    pub pid: u32,
    pub started_at: u64,
}

impl HubState {
    pub fn load() -> Option<HubState> {
        Self::load_from(&config_dir())
    }

    pub fn load_from(dir: &Path) -> Option<HubState> {
        let content = std::fs::read_to_string(dir.join(HUB_STATE_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Write `hub.json` and `hub.pid`. Called once, after both listeners are
    /// bound.
    pub fn write(&self) -> Result<()> {
        self.write_to(&config_dir())
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config dir {}", dir.display()))?;
        std::fs::write(dir.join(HUB_STATE_FILE), serde_json::to_string_pretty(self)?)?;
        std::fs::write(dir.join(HUB_PID_FILE), self.pid.to_string())?;
        Ok(())
    }

    /// Remove both state files. Best-effort; missing files are fine.
    pub fn remove() {
        Self::remove_from(&config_dir());
    }

    pub fn remove_from(dir: &Path) {
        let _ = std::fs::remove_file(dir.join(HUB_STATE_FILE));
        let _ = std::fs::remove_file(dir.join(HUB_PID_FILE));
    }
}
