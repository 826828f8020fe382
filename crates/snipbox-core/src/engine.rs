//! Snippet execution
//!
//! One execution is one short-lived interpreter process:
//!
//! 1. render the scaffold around the snippet into `code_<uuid>.py` inside
//!    the user's sandbox
//! 2. spawn the interpreter there with a scrubbed environment, the rlimit
//!    hook and its own process group
//! 3. `poll` stdout/stderr while watching for exit, keeping a bounded prefix
//! 4. kill the group when the leader exits or the wall-clock deadline
//!    passes, then stop reading after a short grace period
//! 5. map the exit status onto an [`Outcome`] and build the output text
//!
//! [`Engine::run`] never fails: engine faults become
//! [`Outcome::SystemError`] with a generic message and the details go to
//! the log.

use crate::isolation::{ResourceLimits, kill_group};
use crate::result::{ExecutionResult, Limit, Outcome};
use crate::sandbox::Sandbox;
use crate::scaffold::{Capabilities, MEMORY_EXIT, Scaffold};
use crate::{Result, SandboxConfig, SnipboxError};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_TIMEOUT_MS: u16 = 10;

/// How long output is still collected once the leader has exited.
///
/// Anything that left the process group can hold the pipes open forever;
/// after this the read ends are dropped.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Interpreter flags: isolated mode, no .pyc writes, no site-packages, UTF-8 I/O
const PYTHON_FLAGS: &[&str] = &["-I", "-B", "-S", "-X", "utf8"];

/// Marker placed between stdout and stderr in the combined output
pub const ERRORS_MARKER: &str = "\nErrors:\n";

/// Runs snippets inside sandboxes
#[derive(Debug, Clone)]
pub struct Engine {
    python: PathBuf,
    scaffold: Scaffold,
    limits: ResourceLimits,
    timeout: Duration,
    timeout_secs: u64,
    max_output: usize,
    env: Vec<(String, String)>,
}

impl Engine {
    /// Build an engine. The scaffold is rendered here, once.
    #[must_use]
    pub fn new(config: &SandboxConfig, capabilities: &Capabilities) -> Self {
        if !config.python_path.exists() {
            tracing::warn!(python = ?config.python_path, "python interpreter not found");
        }

        let timeout_secs = config.timeout_secs();
        Self {
            python: config.python_path.clone(),
            scaffold: Scaffold::new(capabilities, timeout_secs),
            limits: config.limits,
            timeout: config.timeout,
            timeout_secs,
            max_output: config.max_output,
            env: config.env.clone(),
        }
    }

    /// Execute `source` in `sandbox`
    pub fn run(&self, source: &str, sandbox: &Sandbox) -> ExecutionResult {
        if source.trim().is_empty() {
            return ExecutionResult::no_code();
        }

        let start = Instant::now();
        let result = match self.spawn_and_wait(source, sandbox.path()) {
            Ok(run) => self.interpret(run, start.elapsed()),
            Err(e) => {
                tracing::error!(user = %sandbox.user(), error = %e, "execution failed");
                ExecutionResult::system_error(start.elapsed())
            }
        };

        tracing::info!(
            user = %sandbox.user(),
            outcome = ?result.outcome,
            truncated = result.truncated,
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "execution finished"
        );
        result
    }

    fn spawn_and_wait(&self, source: &str, workdir: &Path) -> Result<RawRun> {
        let script = ScriptFile::create(workdir, &self.scaffold.render(source))?;

        let mut cmd = Command::new(&self.python);
        cmd.args(PYTHON_FLAGS)
            .arg(script.path())
            .current_dir(workdir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.limits.attach(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            SnipboxError::Spawn(format!("failed to start {}: {e}", self.python.display()))
        })?;
        let pid = child.id();
        tracing::debug!(pid, script = ?script.path(), "interpreter spawned");

        // One byte past the ceiling is enough to know truncation happened.
        let cap = self.max_output.saturating_add(1);
        let mut streams = [
            Capture::new(child.stdout.take().map(OwnedFd::from), cap),
            Capture::new(child.stderr.take().map(OwnedFd::from), cap),
        ];

        let watched = watch(pid, self.timeout, &mut streams);

        // Leader is alive or a zombie here, so its group id is still ours.
        if let Err(e) = kill_group(pid) {
            tracing::warn!(pid, error = %e, "failed to kill process group");
        }
        let status = child.wait()?;
        let exited = watched?;

        if !exited {
            tracing::warn!(pid, timeout_secs = self.timeout_secs, "wall-clock timeout, process group killed");
        } else if streams.iter().any(Capture::is_open) {
            tracing::warn!(pid, "output held open outside the process group, read ends dropped");
        }

        let [stdout, stderr] = streams;
        Ok(RawRun {
            status: exited.then_some(status),
            overflow: stdout.overflow || stderr.overflow,
            stdout: stdout.kept,
            stderr: stderr.kept,
        })
    }

    fn interpret(&self, run: RawRun, duration: Duration) -> ExecutionResult {
        let Some(status) = run.status else {
            return self.timed_out(duration);
        };

        let outcome = match (status.code(), status.signal()) {
            (Some(0), _) => Outcome::Completed,
            (Some(MEMORY_EXIT), _) => Outcome::LimitExceeded(Limit::Memory),
            (_, Some(libc::SIGALRM | libc::SIGXCPU)) => Outcome::TimedOut,
            (_, Some(libc::SIGXFSZ)) => Outcome::LimitExceeded(Limit::FileSize),
            (exit_code, signal) => Outcome::UserError { exit_code, signal },
        };

        match outcome {
            Outcome::TimedOut => self.timed_out(duration),
            Outcome::LimitExceeded(limit) => {
                ExecutionResult::message(outcome, self.limit_message(limit), duration)
            }
            _ => {
                let combined = combine(&run.stdout, &run.stderr);
                let (output, truncated) = truncate(combined, self.max_output, run.overflow);
                ExecutionResult {
                    output,
                    truncated,
                    outcome,
                    artifact: None,
                    duration,
                }
            }
        }
    }

    fn timed_out(&self, duration: Duration) -> ExecutionResult {
        ExecutionResult::message(
            Outcome::TimedOut,
            format!(
                "Error: Code execution timed out after {} seconds",
                self.timeout_secs
            ),
            duration,
        )
    }

    fn limit_message(&self, limit: Limit) -> String {
        match limit {
            Limit::Memory => format!(
                "Error: Code execution exceeded the memory limit of {} MB",
                self.limits.memory_mb()
            ),
            Limit::FileSize => format!(
                "Error: Code execution exceeded the file size limit of {} KB",
                self.limits.file_size_kb()
            ),
        }
    }
}

/// What came back from the child before interpretation
struct RawRun {
    /// `None` when the wall-clock deadline fired
    status: Option<ExitStatus>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    overflow: bool,
}

/// The rendered program on disk; removed when dropped, whatever happened
struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    fn create(dir: &Path, program: &str) -> Result<Self> {
        let script = Self {
            path: dir.join(format!("code_{}.py", Uuid::new_v4().simple())),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&script.path)?;
        file.write_all(program.as_bytes())?;

        Ok(script)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = ?self.path, error = %e, "failed to remove script"),
        }
    }
}

/// One output pipe and the bounded prefix read from it so far
struct Capture {
    pipe: Option<File>,
    kept: Vec<u8>,
    cap: usize,
    overflow: bool,
}

impl Capture {
    fn new(pipe: Option<OwnedFd>, cap: usize) -> Self {
        Self {
            pipe: pipe.map(File::from),
            kept: Vec::new(),
            cap,
            overflow: false,
        }
    }

    fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    /// Keep at most `cap` bytes; the rest is read and discarded so the child
    /// never blocks on a full pipe.
    fn keep(&mut self, data: &[u8]) {
        let room = self.cap.saturating_sub(self.kept.len());
        if data.len() > room {
            self.overflow = true;
        }
        self.kept.extend_from_slice(&data[..data.len().min(room)]);
    }

    /// One read after `poll` reported the pipe ready, so it never blocks
    fn read_ready(&mut self) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };

        let mut buf = [0u8; 8192];
        match pipe.read(&mut buf) {
            Ok(0) => self.pipe = None,
            Ok(n) => self.keep(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(_) => self.pipe = None,
        }
    }
}

/// Collect output until the leader has exited and the pipes are drained, or
/// until `timeout` passes.
///
/// Returns `true` if the leader exited. The exit is observed with `WNOWAIT`,
/// so the zombie keeps the process-group id reserved while the rest of the
/// group is killed. Reading stops [`DRAIN_GRACE`] after the exit even if a
/// pipe is still open.
fn watch(leader: u32, timeout: Duration, streams: &mut [Capture]) -> Result<bool> {
    let pid = Pid::from_raw(
        i32::try_from(leader)
            .map_err(|_| SnipboxError::Spawn(format!("pid {leader} out of range")))?,
    );
    let deadline = Instant::now() + timeout;
    let mut exited_at: Option<Instant> = None;

    loop {
        pump(streams)?;

        if exited_at.is_none() && has_exited(pid)? {
            // Group members still holding the pipes go now, so EOF follows.
            if let Err(e) = kill_group(leader) {
                tracing::warn!(pid = leader, error = %e, "failed to kill process group");
            }
            exited_at = Some(Instant::now());
        }

        let now = Instant::now();
        match exited_at {
            Some(_) if !streams.iter().any(Capture::is_open) => return Ok(true),
            Some(at) if now >= at + DRAIN_GRACE => return Ok(true),
            None if now >= deadline => return Ok(false),
            _ => {}
        }
    }
}

/// Wait up to one poll interval for output and read once from each ready pipe
fn pump(streams: &mut [Capture]) -> Result<()> {
    let ready: Vec<bool> = {
        let mut fds: Vec<PollFd<'_>> = streams
            .iter()
            .filter_map(|s| s.pipe.as_ref())
            .map(|pipe| PollFd::new(pipe.as_fd(), PollFlags::POLLIN))
            .collect();

        if fds.is_empty() {
            thread::sleep(POLL_INTERVAL);
            return Ok(());
        }

        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        fds.iter()
            .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
            .collect()
    };

    let mut ready = ready.into_iter();
    for stream in streams.iter_mut().filter(|s| s.is_open()) {
        if ready.next().unwrap_or(false) {
            stream.read_ready();
        }
    }
    Ok(())
}

fn has_exited(pid: Pid) -> Result<bool> {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    match waitid(Id::Pid(pid), flags) {
        Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// stdout, then the errors marker and stderr if there is any
fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        output.push_str(ERRORS_MARKER);
        output.push_str(&String::from_utf8_lossy(stderr));
    }
    output
}

/// Cut `output` to `max` bytes on a character boundary and append the notice once
fn truncate(mut output: String, max: usize, overflowed: bool) -> (String, bool) {
    if output.len() <= max && !overflowed {
        return (output, false);
    }

    let mut end = max.min(output.len());
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output.push_str(&format!("\n... (output truncated, max {max} bytes)"));
    (output, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;

    #[test]
    fn capture_keeps_a_bounded_prefix() {
        let mut capture = Capture::new(None, 101);
        capture.keep(&[b'a'; 60]);
        capture.keep(&[b'b'; 60]);
        assert_eq!(capture.kept.len(), 101);
        assert!(capture.overflow);

        let mut capture = Capture::new(None, 101);
        capture.keep(b"short");
        assert_eq!(capture.kept, b"short");
        assert!(!capture.overflow);
    }

    #[test]
    fn combine_marks_stderr() {
        assert_eq!(combine(b"hello\n", b""), "hello\n");
        assert_eq!(
            combine(b"out\n", b"Traceback\n"),
            "out\n\nErrors:\nTraceback\n"
        );
    }

    #[test]
    fn truncation_notice_is_appended_exactly_once() {
        let (out, truncated) = truncate("x".repeat(50), 10, false);
        assert!(truncated);
        assert!(out.starts_with(&"x".repeat(10)));
        assert_eq!(out.matches("output truncated").count(), 1);
        assert!(out.ends_with("(output truncated, max 10 bytes)"));

        let (out, truncated) = truncate("fits".into(), 10, false);
        assert!(!truncated);
        assert_eq!(out, "fits");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (out, truncated) = truncate("ééééé".into(), 3, false);
        assert!(truncated);
        assert!(out.starts_with('é'));
        assert!(!out.starts_with("éé"));
    }

    #[test]
    fn script_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let script = ScriptFile::create(dir.path(), "print(1)\n").unwrap();
            assert_eq!(fs::read_to_string(script.path()).unwrap(), "print(1)\n");
            script.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    fn spawn_shell(script: &str) -> (std::process::Child, [Capture; 2]) {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = cmd.spawn().unwrap();
        let streams = [
            Capture::new(child.stdout.take().map(OwnedFd::from), 1024),
            Capture::new(child.stderr.take().map(OwnedFd::from), 1024),
        ];
        (child, streams)
    }

    #[test]
    fn watch_reports_the_deadline_and_keeps_early_output() {
        let (mut child, mut streams) = spawn_shell("echo early; sleep 5");
        let started = Instant::now();

        assert!(!watch(child.id(), Duration::from_millis(300), &mut streams).unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(streams[0].kept, b"early\n");

        kill_group(child.id()).unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn watch_returns_once_the_leader_exits() {
        let (mut child, mut streams) = spawn_shell("echo out; echo err >&2");

        assert!(watch(child.id(), Duration::from_secs(5), &mut streams).unwrap());
        assert!(child.wait().unwrap().success());
        assert_eq!(streams[0].kept, b"out\n");
        assert_eq!(streams[1].kept, b"err\n");
    }

    #[test]
    fn background_group_members_do_not_hold_the_run_open() {
        // The sleeper inherits both pipes; it dies with the group.
        let (mut child, mut streams) = spawn_shell("sleep 30 & echo done");
        let started = Instant::now();

        assert!(watch(child.id(), Duration::from_secs(10), &mut streams).unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(streams[0].kept, b"done\n");
        child.wait().unwrap();
    }
}
