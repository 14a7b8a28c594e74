use super::process::{
    boot_id, group_alive, pid_alive, resolve_program, signal_group, start_time, terminate_group,
};
use super::store::SessionStore;
use super::types::*;
use crate::error::{Result, StackError};
use chrono::Utc;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Owns the process groups of every session started from this process and
/// the on-disk records that let a later invocation find them again.
pub struct SessionSupervisor {
    store: SessionStore,
    children: Arc<RwLock<HashMap<String, HashMap<String, Child>>>>,
    stop_grace: Duration,
}

impl SessionSupervisor {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: SessionStore::new(state_dir),
            children: Arc::new(RwLock::new(HashMap::new())),
            stop_grace: Duration::from_secs(5),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Reject duplicate names/ports and empty commands before anything runs.
    pub fn validate(specs: &[ServiceSpec]) -> Result<()> {
        let mut problems = Vec::new();
        let mut names: HashMap<&str, usize> = HashMap::new();
        let mut ports: HashMap<u16, Vec<&str>> = HashMap::new();

        for spec in specs {
            *names.entry(spec.name.as_str()).or_default() += 1;
            ports.entry(spec.port).or_default().push(spec.name.as_str());
            if spec.name.trim().is_empty() {
                problems.push("service with empty name".to_string());
            }
            if spec.command.is_empty() {
                problems.push(format!("service '{}' has an empty command", spec.name));
            }
            if spec.port == 0 {
                problems.push(format!("service '{}' has port 0", spec.name));
            }
        }

        let mut dup_names: Vec<_> = names.into_iter().filter(|(_, n)| *n > 1).collect();
        dup_names.sort();
        for (name, count) in dup_names {
            problems.push(format!("duplicate service name '{name}' ({count} specs)"));
        }

        let mut dup_ports: Vec<_> = ports.into_iter().filter(|(_, owners)| owners.len() > 1).collect();
        dup_ports.sort();
        for (port, owners) in dup_ports {
            problems.push(format!("port {port} claimed by {}", owners.join(", ")));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StackError::Configuration(problems.join("; ")))
        }
    }

    /// Working directories must exist and every program must resolve.
    pub fn preflight(specs: &[ServiceSpec]) -> Result<()> {
        let inherited_path = std::env::var("PATH").ok();
        let mut problems = Vec::new();

        for spec in specs {
            if !spec.working_directory.is_dir() {
                problems.push(format!(
                    "service '{}': working directory {} does not exist",
                    spec.name,
                    spec.working_directory.display()
                ));
                continue;
            }
            let Some(program) = spec.program() else { continue };
            let search_path = spec.environment.get("PATH").map(String::as_str).or(inherited_path.as_deref());
            if resolve_program(program, &spec.working_directory, search_path).is_none() {
                problems.push(format!("service '{}': command '{program}' not found", spec.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StackError::Configuration(problems.join("; ")))
        }
    }

    /// Start one window per spec, in order, after destroying any existing
    /// session with the same id. Returns as soon as the processes are spawned.
    pub async fn start(&self, session_id: &str, specs: &[ServiceSpec]) -> Result<Session> {
        Self::validate(specs)?;
        Self::preflight(specs)?;

        let destroyed = self.stop(session_id).await?;
        if destroyed > 0 {
            info!(session = session_id, windows = destroyed, "destroyed stale session");
        }

        let log_dir = self.store.log_dir(session_id);
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            StackError::Process(format!("cannot create session dir {}: {e}", log_dir.display()))
        })?;

        let mut record = SessionRecord {
            id: session_id.to_string(),
            instance: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339(),
            boot_id: boot_id(),
            windows: Vec::new(),
        };
        let mut children = HashMap::new();
        let mut failed = HashMap::new();

        for spec in specs {
            let log_path = log_dir.join(format!("{}.log", spec.name));
            match spawn_window(spec, &log_path) {
                Ok(child) => {
                    let pid = child.id().unwrap_or(0);
                    info!(session = session_id, service = %spec.name, pid, port = spec.port, "window started");
                    record.windows.push(WindowRecord {
                        name: spec.name.clone(),
                        pid,
                        port: spec.port,
                        log_path,
                        started_at: Utc::now().to_rfc3339(),
                        start_time: start_time(pid),
                    });
                    children.insert(spec.name.clone(), child);
                }
                Err(e) => {
                    error!(session = session_id, service = %spec.name, error = %e, "window failed to start");
                    failed.insert(spec.name.clone(), e.to_string());
                }
            }
        }

        // Without a record the session cannot be found again; undo everything.
        if let Err(e) = self.store.save(&record) {
            for (_, mut child) in children {
                if let Some(pgid) = child.id() {
                    let _ = terminate_owned(pgid, &mut child, self.stop_grace).await;
                }
            }
            return Err(StackError::Process(format!("cannot persist session {session_id}: {e}")));
        }

        self.children.write().await.insert(session_id.to_string(), children);
        Ok(Session { record, failed })
    }

    /// Destroy a session: terminate every window's process group and forget it.
    /// Returns how many live windows were torn down. A missing session is not
    /// an error, and windows that can no longer be attributed to this session
    /// are dropped with a warning rather than signalled.
    pub async fn stop(&self, session_id: &str) -> Result<usize> {
        let record = self.store.load(session_id)?;
        let mut owned = self.children.write().await.remove(session_id).unwrap_or_default();
        let mut stopped = 0;

        if let Some(record) = &record {
            let same_boot = record.boot_id.is_none() || record.boot_id == boot_id();
            if !same_boot {
                warn!(session = session_id, "session was recorded before a reboot; forgetting its windows");
            }

            for window in &record.windows {
                if let Some(mut child) = owned.remove(&window.name) {
                    if let Err(e) = terminate_owned(window.pid, &mut child, self.stop_grace).await {
                        warn!(session = session_id, service = %window.name, error = %e, "failed to terminate window");
                    }
                    stopped += 1;
                    continue;
                }
                if !same_boot || window.pid == 0 {
                    continue;
                }
                // Started by an earlier invocation
                if let (Some(recorded), Some(current)) = (window.start_time, start_time(window.pid)) {
                    if recorded != current {
                        warn!(session = session_id, service = %window.name, pid = window.pid, "pid now belongs to another process; forgetting window");
                        continue;
                    }
                }
                if !group_alive(window.pid) {
                    continue;
                }
                match terminate_group(window.pid, self.stop_grace).await {
                    Ok(()) => stopped += 1,
                    Err(e) => {
                        warn!(session = session_id, service = %window.name, pid = window.pid, error = %e, "cannot signal window group; forgetting window")
                    }
                }
            }
        }

        // Children with no record entry, e.g. after the record was removed by hand
        for (name, mut child) in owned {
            let Some(pgid) = child.id() else { continue };
            if let Err(e) = terminate_owned(pgid, &mut child, self.stop_grace).await {
                warn!(session = session_id, service = %name, error = %e, "failed to terminate window");
            }
            stopped += 1;
        }

        self.store.remove(session_id)?;
        Ok(stopped)
    }

    /// Stop every session this supervisor started.
    pub async fn stop_all(&self) -> Result<usize> {
        let ids: Vec<String> = self.children.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            stopped += self.stop(&id).await?;
        }
        Ok(stopped)
    }

    pub async fn is_alive(&self, session_id: &str, name: &str) -> bool {
        if let Some(windows) = self.children.write().await.get_mut(session_id) {
            if let Some(child) = windows.get_mut(name) {
                return matches!(child.try_wait(), Ok(None));
            }
        }
        match self.store.load(session_id) {
            Ok(Some(record)) => record.window(name).map(leader_running).unwrap_or(false),
            _ => false,
        }
    }

    pub async fn status(&self, session_id: &str) -> Result<Vec<WindowState>> {
        let record = self
            .store
            .load(session_id)?
            .ok_or_else(|| StackError::Process(format!("session {session_id} not found")))?;

        let mut guard = self.children.write().await;
        let mut owned = guard.get_mut(session_id);

        let mut states = Vec::with_capacity(record.windows.len());
        for window in &record.windows {
            let status = match owned.as_mut().and_then(|w| w.get_mut(&window.name)) {
                Some(child) => match child.try_wait() {
                    Ok(None) => WindowStatus::Running,
                    Ok(Some(exit)) => WindowStatus::Exited(exit.code()),
                    Err(e) => WindowStatus::Failed(e.to_string()),
                },
                None if leader_running(window) => WindowStatus::Running,
                None => WindowStatus::Exited(None),
            };
            states.push(WindowState {
                name: window.name.clone(),
                pid: Some(window.pid),
                port: window.port,
                status,
            });
        }
        Ok(states)
    }

    /// Last `lines` lines of a window's captured output.
    pub fn tail(&self, session_id: &str, name: &str, lines: usize) -> Result<Vec<String>> {
        let record = self
            .store
            .load(session_id)?
            .ok_or_else(|| StackError::Process(format!("session {session_id} not found")))?;
        let window = record
            .window(name)
            .ok_or_else(|| StackError::Process(format!("no window '{name}' in session {session_id}")))?;
        read_tail(&window.log_path, lines)
    }
}

/// Terminate the group of a child we own, reap the leader so it never
/// lingers as a zombie, and make sure no group member outlives the grace.
async fn terminate_owned(pgid: u32, child: &mut Child, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    signal_group(pgid, false)?;
    let _ = tokio::time::timeout(grace, child.wait()).await;
    while group_alive(pgid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if group_alive(pgid) {
        signal_group(pgid, true)?;
    }
    child.wait().await?;
    Ok(())
}

/// The recorded leader is still the process we started.
fn leader_running(window: &WindowRecord) -> bool {
    match (window.start_time, start_time(window.pid)) {
        (Some(recorded), Some(current)) => recorded == current && pid_alive(window.pid),
        (Some(_), None) => false,
        (None, _) => pid_alive(window.pid),
    }
}

fn spawn_window(spec: &ServiceSpec, log_path: &Path) -> Result<Child> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| StackError::Configuration(format!("service '{}' has an empty command", spec.name)))?;

    let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
    writeln!(log, "==> {} starting {} at {}", spec.name, spec.command.join(" "), Utc::now().to_rfc3339())?;
    let stderr = log.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(&spec.environment)
        .current_dir(&spec.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);

    // Own group so the whole service tree is signalled together and
    // survives the orchestrator exiting.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
        .map_err(|e| StackError::Process(format!("Failed to spawn '{}' for {}: {e}", program, spec.name)))
}

fn read_tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}
