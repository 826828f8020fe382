//! Per-user sandbox directory lifecycle
//!
//! Every user owns at most one private working directory under the sandbox
//! root. The process-wide map only hands out per-user slots; all work on a
//! sandbox happens under that user's own lock, so a reset can never race an
//! execution for the same user while different users never contend.

use crate::result::SandboxStatus;
use crate::{Result, SnipboxError, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A live sandbox directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    user: UserId,
    path: PathBuf,
    created: SystemTime,
}

impl Sandbox {
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn created(&self) -> SystemTime {
        self.created
    }

    /// Time since creation
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed().unwrap_or_default()
    }
}

#[derive(Debug)]
struct Slot {
    sandbox: Option<Sandbox>,
    last_used: Instant,
}

impl Slot {
    fn empty() -> Self {
        Self {
            sandbox: None,
            last_used: Instant::now(),
        }
    }
}

/// Process-wide owner of all sandboxes
#[derive(Debug)]
pub struct SandboxManager {
    root: PathBuf,
    slots: Mutex<HashMap<UserId, Arc<Mutex<Slot>>>>,
}

impl SandboxManager {
    /// Create a manager rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        DirBuilder::new().recursive(true).mode(0o700).create(&root)?;

        tracing::debug!(root = ?root, "sandbox manager ready");
        Ok(Self {
            root,
            slots: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot(&self, user: &UserId) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(user.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::empty()))),
        )
    }

    /// Return the user's sandbox, creating it if there is none
    pub fn ensure(&self, user: &UserId) -> Result<Sandbox> {
        self.with_sandbox(user, Clone::clone)
    }

    /// Ensure the sandbox and run `f` while holding the user's lock.
    ///
    /// A reset or destroy for the same user waits until `f` returns.
    pub fn with_sandbox<R>(&self, user: &UserId, f: impl FnOnce(&Sandbox) -> R) -> Result<R> {
        let slot = self.slot(user);
        let mut slot = slot.lock();

        let live = slot.sandbox.as_ref().is_some_and(|s| s.path.is_dir());
        if !live {
            if let Some(stale) = slot.sandbox.take() {
                tracing::warn!(user = %user, path = ?stale.path, "sandbox directory vanished, recreating");
            }
            slot.sandbox = Some(self.create(user)?);
        }

        slot.last_used = Instant::now();
        let sandbox = slot
            .sandbox
            .as_ref()
            .ok_or_else(|| SnipboxError::Sandbox("sandbox missing after creation".into()))?;
        Ok(f(sandbox))
    }

    /// Destroy the user's sandbox (if any) and create a fresh one
    pub fn reset(&self, user: &UserId) -> Result<Sandbox> {
        let slot = self.slot(user);
        let mut slot = slot.lock();

        if let Some(old) = slot.sandbox.take() {
            remove_tree(&old);
        }
        let fresh = self.create(user)?;
        slot.sandbox = Some(fresh.clone());
        slot.last_used = Instant::now();

        tracing::info!(user = %user, path = ?fresh.path, "sandbox reset");
        Ok(fresh)
    }

    /// Remove the user's sandbox directory and forget it
    pub fn destroy(&self, user: &UserId) {
        let slot = self.slot(user);
        if let Some(old) = slot.lock().sandbox.take() {
            remove_tree(&old);
            tracing::info!(user = %user, "sandbox destroyed");
        }
        drop(slot);

        let mut slots = self.slots.lock();
        if slots.get(user).is_some_and(is_unused) {
            slots.remove(user);
        }
    }

    /// Whether the user has a sandbox, and how old it is
    #[must_use]
    pub fn status(&self, user: &UserId) -> SandboxStatus {
        let slot = self.slots.lock().get(user).map(Arc::clone);
        let sandbox = slot.and_then(|slot| slot.lock().sandbox.clone());

        SandboxStatus {
            user: user.to_string(),
            sandbox_created: sandbox.is_some(),
            sandbox_age_secs: sandbox.map_or(0, |s| s.age().as_secs()),
        }
    }

    /// Destroy sandboxes that have not been used for `max_idle`.
    ///
    /// Sandboxes that are busy right now are skipped. Returns how many were
    /// destroyed.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut reaped = 0;

        for (user, slot) in self.snapshot() {
            let Some(mut slot) = slot.try_lock() else {
                continue;
            };
            if slot.sandbox.is_some() && slot.last_used.elapsed() >= max_idle {
                if let Some(old) = slot.sandbox.take() {
                    remove_tree(&old);
                }
                tracing::info!(user = %user, "idle sandbox reclaimed");
                reaped += 1;
            }
        }

        self.prune();
        reaped
    }

    /// Destroy every sandbox; used on shutdown. Returns how many were removed.
    pub fn destroy_all(&self) -> usize {
        let mut destroyed = 0;

        for (_, slot) in self.snapshot() {
            if let Some(old) = slot.lock().sandbox.take() {
                remove_tree(&old);
                destroyed += 1;
            }
        }

        self.prune();
        tracing::info!(destroyed, "all sandboxes destroyed");
        destroyed
    }

    /// Forget users with no sandbox that nobody is working on
    fn prune(&self) {
        self.slots.lock().retain(|_, slot| !is_unused(slot));
    }

    fn snapshot(&self) -> Vec<(UserId, Arc<Mutex<Slot>>)> {
        self.slots
            .lock()
            .iter()
            .map(|(user, slot)| (user.clone(), Arc::clone(slot)))
            .collect()
    }

    fn create(&self, user: &UserId) -> Result<Sandbox> {
        let created = SystemTime::now();
        let millis = created
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let base = format!("sandbox_{user}_{millis}");
        let mut path = self.root.join(&base);

        let mut builder = DirBuilder::new();
        builder.mode(0o700);

        if let Err(e) = builder.create(&path) {
            if e.kind() != ErrorKind::AlreadyExists {
                return Err(e.into());
            }
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            path = self.root.join(format!("{base}_{}", &suffix[..8]));
            builder.create(&path)?;
        }

        // mode() is filtered through the umask; make the result exact
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;

        tracing::debug!(user = %user, path = ?path, "sandbox created");
        Ok(Sandbox {
            user: user.clone(),
            path,
            created,
        })
    }
}

/// Empty and unreferenced outside the map.
///
/// Only called with the map lock held, so no new reference can appear.
fn is_unused(slot: &Arc<Mutex<Slot>>) -> bool {
    Arc::strong_count(slot) == 1 && slot.try_lock().is_some_and(|s| s.sandbox.is_none())
}

/// Best-effort recursive removal; a missing directory is fine
fn remove_tree(sandbox: &Sandbox) {
    match fs::remove_dir_all(&sandbox.path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(user = %sandbox.user, path = ?sandbox.path, error = %e, "failed to remove sandbox directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::new(name).unwrap()
    }

    fn dirs_for(root: &Path, user: &str) -> Vec<PathBuf> {
        let prefix = format!("sandbox_{user}_");
        fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect()
    }

    #[test]
    fn ensure_creates_once_and_reuses() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();
        let alice = user("alice");

        let first = manager.ensure(&alice).unwrap();
        let second = manager.ensure(&alice).unwrap();

        assert_eq!(first.path(), second.path());
        assert!(first.path().is_dir());
        let mode = fs::metadata(first.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert_eq!(dirs_for(root.path(), "alice").len(), 1);
    }

    #[test]
    fn double_reset_leaves_one_empty_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();
        let bob = user("bob");

        let before = manager.ensure(&bob).unwrap();
        fs::write(before.path().join("leftover.txt"), b"x").unwrap();

        manager.reset(&bob).unwrap();
        let after = manager.reset(&bob).unwrap();

        let dirs = dirs_for(root.path(), "bob");
        assert_eq!(dirs, vec![after.path().to_path_buf()]);
        assert_eq!(fs::read_dir(after.path()).unwrap().count(), 0);
    }

    #[test]
    fn destroy_is_idempotent_and_tolerates_missing_dirs() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();
        let carol = user("carol");

        let sandbox = manager.ensure(&carol).unwrap();
        fs::remove_dir_all(sandbox.path()).unwrap();

        manager.destroy(&carol);
        manager.destroy(&carol);
        assert!(!manager.status(&carol).sandbox_created);
    }

    #[test]
    fn vanished_directory_is_recreated_on_use() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();
        let dave = user("dave");

        let sandbox = manager.ensure(&dave).unwrap();
        fs::remove_dir_all(sandbox.path()).unwrap();

        let again = manager.ensure(&dave).unwrap();
        assert!(again.path().is_dir());
    }

    #[test]
    fn users_get_separate_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();

        let a = manager.ensure(&user("a")).unwrap();
        let b = manager.ensure(&user("b")).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn status_reports_presence() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();
        let erin = user("erin");

        assert!(!manager.status(&erin).sandbox_created);
        manager.ensure(&erin).unwrap();
        let status = manager.status(&erin);
        assert!(status.sandbox_created);
        assert_eq!(status.user, "erin");
    }

    #[test]
    fn reaping_only_touches_idle_sandboxes() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();

        let idle = manager.ensure(&user("idle")).unwrap();
        assert_eq!(manager.reap_idle(Duration::from_secs(3600)), 0);
        assert!(idle.path().is_dir());

        assert_eq!(manager.reap_idle(Duration::ZERO), 1);
        assert!(!idle.path().exists());
        assert!(!manager.status(&user("idle")).sandbox_created);
    }

    #[test]
    fn destroy_all_clears_everything() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();

        for name in ["u1", "u2", "u3"] {
            manager.ensure(&user(name)).unwrap();
        }
        assert_eq!(manager.destroy_all(), 3);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn concurrent_reset_and_use_never_see_half_state() {
        let root = tempfile::tempdir().unwrap();
        let manager = Arc::new(SandboxManager::new(root.path()).unwrap());
        let frank = user("frank");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let frank = frank.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if i % 2 == 0 {
                            manager.reset(&frank).unwrap();
                        } else {
                            manager
                                .with_sandbox(&frank, |s| {
                                    assert!(s.path().is_dir());
                                    fs::write(s.path().join("marker"), b"ok").unwrap();
                                })
                                .unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dirs_for(root.path(), "frank").len(), 1);
    }

    #[test]
    fn destroy_forgets_the_user() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();

        for i in 0..1000 {
            let id = user(&format!("user{i}"));
            manager.ensure(&id).unwrap();
            manager.destroy(&id);
        }
        manager.destroy(&user("never-seen"));

        assert_eq!(manager.slots.lock().len(), 0);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn reaping_and_shutdown_forget_users() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(root.path()).unwrap();

        for name in ["r1", "r2", "r3"] {
            manager.ensure(&user(name)).unwrap();
        }
        assert_eq!(manager.reap_idle(Duration::ZERO), 3);
        assert_eq!(manager.slots.lock().len(), 0);

        manager.ensure(&user("s1")).unwrap();
        assert_eq!(manager.destroy_all(), 1);
        assert_eq!(manager.slots.lock().len(), 0);
    }

    #[test]
    fn forgetting_never_loses_a_live_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let manager = Arc::new(SandboxManager::new(root.path()).unwrap());
        let gina = user("gina");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let gina = gina.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            manager.destroy(&gina);
                        } else {
                            manager.ensure(&gina).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever won the race, the map and the disk agree.
        let tracked = manager.status(&gina).sandbox_created;
        assert_eq!(dirs_for(root.path(), "gina").len(), usize::from(tracked));
        assert!(manager.slots.lock().len() <= 1);
    }
}
