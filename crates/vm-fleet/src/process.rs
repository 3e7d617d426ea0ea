use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::command::{Privilege, exec_command_ignore_errors};
use crate::error::{FleetError, Result};

/// Whether a process with `pid` is alive (signal 0 probe).
///
/// `EPERM` counts as alive: the process exists but belongs to another user.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Terminate `pid` gracefully: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Signals go through sudo because the firecracker chain
/// (`sudo → ip netns exec → sudo -u → firecracker`) runs partly as root.
pub async fn kill_with_grace(pid: u32, grace: Duration) -> Result<()> {
    if !pid_alive(pid) {
        return Ok(());
    }

    exec_command_ignore_errors(&format!("kill -TERM {pid}"), Privilege::Sudo).await;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    exec_command_ignore_errors(&format!("kill -KILL {pid}"), Privilege::Sudo).await;
    Ok(())
}

/// Get the current username via `getuid()`.
pub fn current_username() -> Result<String> {
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|e| FleetError::Config(format!("lookup uid {uid}: {e}")))?
        .ok_or_else(|| FleetError::Config(format!("no user for uid {uid}")))?;
    Ok(user.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn impossible_pid_is_dead() {
        // PIDs are capped at 2^22 on Linux.
        assert!(!pid_alive(u32::MAX - 1));
    }

    #[test]
    fn current_username_resolves() {
        let name = current_username().unwrap();
        assert!(!name.is_empty());
    }
}
