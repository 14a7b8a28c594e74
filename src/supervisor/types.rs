use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Declarative description of one managed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub working_directory: PathBuf,
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub port: u16,
    #[serde(default)]
    pub health_path: Option<String>,
}

impl ServiceSpec {
    pub fn new(name: &str, working_directory: impl Into<PathBuf>, command: &[&str], port: u16) -> Self {
        Self {
            name: name.to_string(),
            working_directory: working_directory.into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            environment: BTreeMap::new(),
            port,
            health_path: None,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_health_path(mut self, path: &str) -> Self {
        self.health_path = Some(path.to_string());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }
}

/// Window as persisted in the session state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRecord {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub log_path: PathBuf,
    pub started_at: String,
    /// Kernel start time of the group leader, where the platform exposes it.
    #[serde(default)]
    pub start_time: Option<u64>,
}

/// A session as persisted between invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub instance: String,
    pub created_at: String,
    #[serde(default)]
    pub boot_id: Option<String>,
    pub windows: Vec<WindowRecord>,
}

impl SessionRecord {
    pub fn window(&self, name: &str) -> Option<&WindowRecord> {
        self.windows.iter().find(|w| w.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WindowStatus {
    Running,
    Exited(Option<i32>),
    Failed(String),
}

/// Snapshot of one window, returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowState {
    pub name: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub status: WindowStatus,
}

/// Result of a `start`: the session plus any windows that failed to launch.
#[derive(Debug, Clone)]
pub struct Session {
    pub record: SessionRecord,
    pub failed: HashMap<String, String>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
