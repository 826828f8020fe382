//! Execution result types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Message returned for an empty or whitespace-only snippet
pub const NO_CODE_MESSAGE: &str = "No code provided";

/// Message returned when the engine itself failed; carries no detail on purpose
pub const SYSTEM_ERROR_MESSAGE: &str = "System error: unable to run code";

/// Which ceiling a snippet ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Limit {
    Memory,
    FileSize,
}

/// How an execution ended.
///
/// `UserError` means the snippet itself faulted and is an ordinary result;
/// `SystemError` means the engine could not do its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Exited normally
    Completed,
    /// Raised an exception, failed to compile, or died on an unexpected signal
    UserError {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// Wall-clock timeout, alarm or CPU ceiling
    TimedOut,
    /// Memory or file-size ceiling
    LimitExceeded(Limit),
    /// Spawn or filesystem failure in the engine
    SystemError,
    /// Nothing to run
    NoCode,
}

impl Outcome {
    /// Whether output from this run is the snippet's own and may be published
    #[must_use]
    pub const fn produced_output(&self) -> bool {
        matches!(self, Self::Completed | Self::UserError { .. })
    }
}

/// A published markup document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Stored file name, `<user>_<uuid>.html`
    pub id: String,
    /// Location in the artifact directory
    pub path: PathBuf,
    /// Address the surrounding layer serves it under
    pub url: String,
}

/// Result of a sandboxed code execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Combined output: stdout, then `Errors:` and stderr when present
    pub output: String,

    /// Whether `output` was cut at the configured maximum
    pub truncated: bool,

    /// How the run ended
    pub outcome: Outcome,

    /// Published markup document, if the output looked like markup
    pub artifact: Option<ArtifactRef>,

    /// Execution duration
    pub duration: Duration,
}

impl ExecutionResult {
    /// A result carrying only a fixed message
    #[must_use]
    pub fn message(outcome: Outcome, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: output.into(),
            truncated: false,
            outcome,
            artifact: None,
            duration,
        }
    }

    #[must_use]
    pub fn no_code() -> Self {
        Self::message(Outcome::NoCode, NO_CODE_MESSAGE, Duration::ZERO)
    }

    #[must_use]
    pub fn system_error(duration: Duration) -> Self {
        Self::message(Outcome::SystemError, SYSTEM_ERROR_MESSAGE, duration)
    }

    /// Check if execution was successful (clean exit, no fault, no limit)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::no_code()
    }
}

/// What the caller can learn about a user's sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub user: String,
    pub sandbox_created: bool,
    pub sandbox_age_secs: u64,
}
