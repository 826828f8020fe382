//! Sandbox configuration

use crate::isolation::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the engine, the sandbox manager and the artifact store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path to Python interpreter
    pub python_path: PathBuf,

    /// Directory under which per-user sandbox directories are created
    pub sandbox_root: PathBuf,

    /// Flat directory holding published markup artifacts
    pub artifact_dir: PathBuf,

    /// Ceilings applied to every child before user code runs
    pub limits: ResourceLimits,

    /// Maximum wall-clock time per execution
    pub timeout: Duration,

    /// Maximum size of the combined output returned to the caller, in bytes
    pub max_output: usize,

    /// Sandboxes idle for longer than this are reclaimed
    pub session_timeout: Duration,

    /// Environment variables passed to the interpreter (nothing else is inherited)
    pub env: Vec<(String, String)>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("/usr/bin/python3"),
            sandbox_root: PathBuf::from("/tmp/snipbox/sandboxes"),
            artifact_dir: PathBuf::from("/tmp/snipbox/html_outputs"),
            limits: ResourceLimits::default(),
            timeout: Duration::from_secs(5),
            max_output: 10 * 1024, // 10KB
            session_timeout: Duration::from_secs(30 * 60),
            env: vec![
                ("PATH".into(), "/usr/bin:/bin".into()),
                ("PYTHONPATH".into(), String::new()),
            ],
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Timeout rounded up to whole seconds, as used by the in-process alarm
    #[must_use]
    pub fn timeout_secs(&self) -> u64 {
        let secs = self.timeout.as_secs();
        if self.timeout.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
    }
}

/// Builder for `SandboxConfig`
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    #[must_use]
    pub fn python_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.python_path = path.into();
        self
    }

    #[must_use]
    pub fn sandbox_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sandbox_root = path.into();
        self
    }

    #[must_use]
    pub fn artifact_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.artifact_dir = path.into();
        self
    }

    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.limits.memory_bytes = bytes;
        self
    }

    #[must_use]
    pub fn memory_limit_mb(self, mb: u64) -> Self {
        self.memory_limit(mb.saturating_mul(1024 * 1024))
    }

    #[must_use]
    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.config.limits.file_size_bytes = bytes;
        self
    }

    /// Sets the wall-clock timeout and the matching CPU-time ceiling
    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self.config.limits.cpu_secs = self.config.timeout_secs();
        self
    }

    /// Overrides the CPU-time ceiling set by [`Self::timeout`]
    #[must_use]
    pub fn cpu_limit_secs(mut self, secs: u64) -> Self {
        self.config.limits.cpu_secs = secs;
        self
    }

    #[must_use]
    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    #[must_use]
    pub fn max_output(mut self, bytes: usize) -> Self {
        self.config.max_output = bytes;
        self
    }

    #[must_use]
    pub fn session_timeout(mut self, duration: Duration) -> Self {
        self.config.session_timeout = duration;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

/// Get default socket path from `SNIPBOX_SOCKET` env var or system default
///
/// Returns:
/// - `$SNIPBOX_SOCKET` if set (for development)
/// - `/run/snipbox/snipbox.sock` otherwise (production)
pub fn default_socket_path() -> PathBuf {
    std::env::var("SNIPBOX_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/snipbox/snipbox.sock"))
}
