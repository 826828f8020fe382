//! Daemon configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use snipbox_core::SandboxConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// Permission bits applied to the socket after binding
    pub socket_mode: u32,

    /// How often idle sandboxes are looked for, in seconds
    pub reap_interval_secs: u64,

    /// Engine, sandbox and artifact settings
    pub sandbox_config: SandboxConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: snipbox_core::config::default_socket_path(),
            socket_mode: 0o660,
            reap_interval_secs: 60,
            sandbox_config: SandboxConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Read a JSON config file, or fall back to defaults when there is none.
    ///
    /// Missing keys take their default values.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}
