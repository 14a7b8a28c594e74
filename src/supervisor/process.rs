//! OS-level helpers for window process groups.

use crate::error::{Result, StackError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Signal the process group led by `pid`.
#[cfg(unix)]
pub fn signal_group(pid: u32, force: bool) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // group 0 is our own
    if pid == 0 {
        return Err(StackError::Process("refusing to signal process group 0".into()));
    }
    let raw = i32::try_from(pid).map_err(|_| StackError::Process(format!("pid {pid} out of range")))?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(StackError::Process(format!("Failed to signal group {pid}: {e}"))),
    }
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, _force: bool) -> Result<()> {
    let raw = pid.to_string();
    std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", raw.as_str()])
        .output()
        .map_err(|e| StackError::Process(format!("Failed to kill process tree {pid}: {e}")))?;
    Ok(())
}

/// True while any member of the group led by `pgid` exists, leader or not.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match i32::try_from(pgid) {
        Ok(0) | Err(_) => false,
        Ok(raw) => killpg(Pid::from_raw(raw), None).is_ok(),
    }
}

#[cfg(not(unix))]
pub fn group_alive(pgid: u32) -> bool {
    pid_alive(pgid)
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL whatever is left.
/// The leader may already be gone; its workers are still signalled.
pub async fn terminate_group(pgid: u32, grace: Duration) -> Result<()> {
    signal_group(pgid, false)?;
    let deadline = Instant::now() + grace;
    while group_alive(pgid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if group_alive(pgid) {
        signal_group(pgid, true)?;
    }
    Ok(())
}

/// Kernel start time of `pid` in clock ticks since boot. Together with the
/// boot id this tells a recorded window apart from a later process that
/// reused its pid.
#[cfg(target_os = "linux")]
pub fn start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest starts at field 3 (state); starttime is field 22
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn start_time(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub fn boot_id() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

#[cfg(not(target_os = "linux"))]
pub fn boot_id() -> Option<String> {
    None
}

/// Locate `program` the way a shell would: paths with a separator are taken
/// relative to `cwd`, bare names are looked up on `search_path`.
pub fn resolve_program(program: &str, cwd: &Path, search_path: Option<&str>) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let candidate = cwd.join(program);
        return candidate.is_file().then_some(candidate);
    }
    let search_path = search_path?;
    std::env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bare_name_on_path() {
        let path = std::env::var("PATH").ok();
        let found = resolve_program("sh", Path::new("/"), path.as_deref());
        assert!(found.is_some());
        assert!(resolve_program("definitely-not-a-real-binary-x9", Path::new("/"), path.as_deref()).is_none());
    }

    #[test]
    fn test_resolve_relative_to_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serve.sh"), "#!/bin/sh\n").unwrap();

        assert!(resolve_program("./serve.sh", dir.path(), None).is_some());
        assert!(resolve_program("./missing.sh", dir.path(), None).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_start_time_identifies_process() {
        let own = start_time(std::process::id());
        assert!(own.is_some());
        assert_eq!(own, start_time(std::process::id()));
        assert!(start_time(u32::MAX).is_none());
        assert!(boot_id().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_group_is_not_alive() {
        assert!(!group_alive(u32::MAX));
        assert!(!group_alive(0));
        assert!(signal_group(0, false).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_pid_is_not_alive() {
        assert!(!pid_alive(u32::MAX));
        assert!(pid_alive(std::process::id()));
    }
}
