use crate::error::{Result, StackError};
use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait ProcessLocator: Send + Sync {
    /// Pids with a listening socket on `port`.
    async fn listening_pids(&self, port: u16) -> Result<Vec<u32>>;
    /// Send SIGTERM, or SIGKILL when `force` is set.
    async fn terminate(&self, pid: u32, force: bool) -> Result<()>;
}

/// Finds listeners with `lsof` and signals them directly.
pub struct SystemProcessLocator;

#[async_trait]
impl ProcessLocator for SystemProcessLocator {
    async fn listening_pids(&self, port: u16) -> Result<Vec<u32>> {
        let filter = format!("-iTCP:{port}");
        let output = Command::new("lsof")
            .args(["-nP", "-t", filter.as_str(), "-sTCP:LISTEN"])
            .output()
            .await
            .map_err(|e| StackError::Process(format!("Failed to run lsof: {e}")))?;

        lsof_listeners(
            port,
            output.status.success(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    #[cfg(unix)]
    async fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| StackError::Process(format!("pid {pid} out of range")))?;
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(StackError::Process(format!("Failed to signal {pid}: {e}"))),
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&self, pid: u32, _force: bool) -> Result<()> {
        let pid = pid.to_string();
        Command::new("taskkill")
            .args(["/F", "/PID", pid.as_str()])
            .output()
            .await
            .map_err(|e| StackError::Process(format!("Failed to kill process: {e}")))?;
        Ok(())
    }
}

/// lsof exits 1 with no output at all when nothing matches. A failure that
/// says something on stderr and lists no pids means the lookup itself broke.
fn lsof_listeners(port: u16, success: bool, stdout: &str, stderr: &str) -> Result<Vec<u32>> {
    let pids = parse_pids(stdout);
    if !success && pids.is_empty() && !stderr.trim().is_empty() {
        return Err(StackError::Process(format!(
            "lsof failed for port {port}: {}",
            stderr.trim()
        )));
    }
    Ok(pids)
}

pub(crate) fn parse_pids(raw: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = raw
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
pub struct MockProcessLocator {
    pub listeners: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<u16, Vec<u32>>>>,
    /// Pids that ignore SIGTERM but die on SIGKILL.
    pub ignores_term: Vec<u32>,
    /// Pids that survive every signal.
    pub unkillable: Vec<u32>,
    pub signals: std::sync::Arc<std::sync::Mutex<Vec<(u32, bool)>>>,
}

#[cfg(test)]
impl MockProcessLocator {
    pub fn new(listeners: &[(u16, &[u32])]) -> Self {
        Self {
            listeners: std::sync::Arc::new(std::sync::Mutex::new(
                listeners.iter().map(|(p, pids)| (*p, pids.to_vec())).collect(),
            )),
            ignores_term: Vec::new(),
            unkillable: Vec::new(),
            signals: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ProcessLocator for MockProcessLocator {
    async fn listening_pids(&self, port: u16) -> Result<Vec<u32>> {
        Ok(self.listeners.lock().unwrap().get(&port).cloned().unwrap_or_default())
    }

    async fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        self.signals.lock().unwrap().push((pid, force));
        let dies = !self.unkillable.contains(&pid) && (force || !self.ignores_term.contains(&pid));
        if dies {
            for pids in self.listeners.lock().unwrap().values_mut() {
                pids.retain(|p| *p != pid);
            }
        }
        Ok(())
    }
}
