//! The operations offered to the surrounding request layer

use crate::artifact::ArtifactStore;
use crate::engine::Engine;
use crate::error::FetchError;
use crate::markup;
use crate::result::{ExecutionResult, SandboxStatus};
use crate::sandbox::SandboxManager;
use crate::scaffold::Capabilities;
use crate::{Result, SandboxConfig, UserId};
use std::time::Duration;

/// Sandboxed snippet execution for many users.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Snipbox {
    engine: Engine,
    sandboxes: SandboxManager,
    artifacts: ArtifactStore,
    session_timeout: Duration,
}

impl Snipbox {
    /// Build the service with the standard capability table
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        Self::with_capabilities(config, &Capabilities::standard())
    }

    pub fn with_capabilities(config: &SandboxConfig, capabilities: &Capabilities) -> Result<Self> {
        let service = Self {
            engine: Engine::new(config, capabilities),
            sandboxes: SandboxManager::new(&config.sandbox_root)?,
            artifacts: ArtifactStore::new(&config.artifact_dir)?,
            session_timeout: config.session_timeout,
        };

        tracing::info!(
            sandbox_root = ?config.sandbox_root,
            artifact_dir = ?config.artifact_dir,
            timeout_secs = config.timeout_secs(),
            memory_mb = config.limits.memory_mb(),
            "snipbox ready"
        );
        Ok(service)
    }

    /// Run `source` for `user` and publish an artifact if the output looks
    /// like markup.
    ///
    /// Never fails: engine faults come back as [`crate::Outcome::SystemError`].
    pub fn execute(&self, user: &UserId, source: &str) -> ExecutionResult {
        if source.trim().is_empty() {
            return ExecutionResult::no_code();
        }

        let result = self
            .sandboxes
            .with_sandbox(user, |sandbox| self.engine.run(source, sandbox));

        let mut result = match result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "sandbox unavailable");
                return ExecutionResult::system_error(Duration::ZERO);
            }
        };

        if result.outcome.produced_output() && markup::looks_like_markup(source, &result.output) {
            self.publish(user, &mut result);
        }
        result
    }

    fn publish(&self, user: &UserId, result: &mut ExecutionResult) {
        let Some(document) = markup::extract(&result.output) else {
            return;
        };

        match self.artifacts.publish(user, &document) {
            Ok(artifact) => {
                tracing::info!(user = %user, artifact = %artifact.id, "markup output published");
                result.artifact = Some(artifact);
            }
            Err(e) => tracing::error!(user = %user, error = %e, "failed to publish artifact"),
        }
    }

    /// Replace the user's sandbox with a fresh, empty one
    pub fn reset_sandbox(&self, user: &UserId) -> Result<()> {
        self.sandboxes.reset(user).map(drop)
    }

    /// Remove the user's sandbox, e.g. on logout
    pub fn destroy_sandbox(&self, user: &UserId) {
        self.sandboxes.destroy(user);
    }

    /// Read an artifact the user owns
    pub fn fetch_artifact(&self, user: &UserId, id: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.artifacts.fetch(user, id)
    }

    #[must_use]
    pub fn status(&self, user: &UserId) -> SandboxStatus {
        self.sandboxes.status(user)
    }

    /// Destroy sandboxes idle for longer than the session timeout
    pub fn reap_expired(&self) -> usize {
        self.sandboxes.reap_idle(self.session_timeout)
    }

    /// Destroy every sandbox; artifacts are kept
    pub fn shutdown(&self) -> usize {
        self.sandboxes.destroy_all()
    }

    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(root: &std::path::Path) -> Snipbox {
        let config = SandboxConfig::builder()
            .sandbox_root(root.join("sandboxes"))
            .artifact_dir(root.join("artifacts"))
            .session_timeout(Duration::ZERO)
            .build();
        Snipbox::new(&config).unwrap()
    }

    #[test]
    fn blank_source_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let snipbox = service(dir.path());
        let alice = UserId::new("alice").unwrap();

        let result = snipbox.execute(&alice, "  \n\t");
        assert_eq!(result.outcome, crate::Outcome::NoCode);
        assert_eq!(result.output, crate::result::NO_CODE_MESSAGE);
        assert!(!snipbox.status(&alice).sandbox_created);
    }

    #[test]
    fn reset_status_and_logout() {
        let dir = tempfile::tempdir().unwrap();
        let snipbox = service(dir.path());
        let bob = UserId::new("bob").unwrap();

        snipbox.reset_sandbox(&bob).unwrap();
        assert!(snipbox.status(&bob).sandbox_created);

        snipbox.destroy_sandbox(&bob);
        assert!(!snipbox.status(&bob).sandbox_created);
    }

    #[test]
    fn expired_sessions_are_reaped_and_shutdown_clears_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let snipbox = service(dir.path());
        let carol = UserId::new("carol").unwrap();

        snipbox.reset_sandbox(&carol).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(snipbox.reap_expired(), 1);
        assert!(!snipbox.status(&carol).sandbox_created);

        snipbox.reset_sandbox(&carol).unwrap();
        assert_eq!(snipbox.shutdown(), 1);
        assert_eq!(
            std::fs::read_dir(dir.path().join("sandboxes")).unwrap().count(),
            0
        );
    }
}
