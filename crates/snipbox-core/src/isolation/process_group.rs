//! Process-group teardown for spawned snippets

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

/// SIGKILL every process in the group led by `leader`.
///
/// Children are spawned as group leaders, so this reaches anything the
/// snippet forked as well. A group that is already gone is not an error.
pub fn kill_group(leader: u32) -> nix::Result<()> {
    let Ok(raw) = i32::try_from(leader) else {
        return Err(Errno::EINVAL);
    };

    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}
