//! setrlimit ceilings applied between fork and exec

use nix::sys::resource::{Resource, setrlimit};
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// CPU, address-space and file-size ceilings for one child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU seconds before SIGXCPU (RLIMIT_CPU soft limit)
    pub cpu_secs: u64,
    /// Address-space ceiling in bytes (RLIMIT_AS)
    pub memory_bytes: u64,
    /// Largest file the child may write, in bytes (RLIMIT_FSIZE)
    pub file_size_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_secs: 5,
            memory_bytes: 50 * 1024 * 1024, // 50MB
            file_size_bytes: 1024 * 1024,   // 1MB
        }
    }
}

impl ResourceLimits {
    /// Apply the ceilings to the calling process.
    ///
    /// Only async-signal-safe calls happen here: this runs in the forked
    /// child right before `execve`.
    pub fn apply(&self) -> nix::Result<()> {
        // The hard CPU limit sits one second above the soft one so the soft
        // limit is reported as SIGXCPU instead of an anonymous SIGKILL.
        let (cpu_soft, cpu_hard) = self.cpu_bounds();
        setrlimit(Resource::RLIMIT_CPU, cpu_soft, cpu_hard)?;
        setrlimit(Resource::RLIMIT_AS, self.memory_bytes, self.memory_bytes)?;
        setrlimit(
            Resource::RLIMIT_FSIZE,
            self.file_size_bytes,
            self.file_size_bytes,
        )?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }

    /// Attach the ceilings to `cmd` so they are in force before the
    /// interpreter executes its first instruction.
    ///
    /// The child also becomes the leader of a fresh process group (so the
    /// whole tree can be killed with one `killpg`) and is killed if the
    /// parent dies first. The parent's own limits are never touched.
    pub fn attach(&self, cmd: &mut Command) {
        let limits = *self;
        cmd.process_group(0);

        // SAFETY: the closure only makes async-signal-safe syscalls
        // (setrlimit, prctl) and does not allocate.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || {
                limits.apply()?;
                nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)?;
                Ok(())
            });
        }
    }

    /// Soft and hard `RLIMIT_CPU`; the hard limit never wraps below the soft one
    #[must_use]
    pub const fn cpu_bounds(&self) -> (u64, u64) {
        (self.cpu_secs, self.cpu_secs.saturating_add(1))
    }

    /// Memory ceiling in whole megabytes, for messages
    #[must_use]
    pub const fn memory_mb(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }

    /// File-size ceiling in whole kilobytes, for messages
    #[must_use]
    pub const fn file_size_kb(&self) -> u64 {
        self.file_size_bytes / 1024
    }
}
