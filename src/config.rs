//! Stack configuration.
//!
//! Assembled once at startup from built-in defaults overlaid by environment
//! lookups, then passed by reference to every component. Nothing else in the
//! crate reads the environment.

use crate::error::{Result, StackError};
use crate::supervisor::ServiceSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SESSION: &str = "devstack";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TES_PORT: u16 = 8000;
pub const DEFAULT_TOOLSERVER_PORT: u16 = 8001;
pub const DEFAULT_WORKBENCH_PORT: u16 = 8002;
pub const DEFAULT_LIMSX_PORT: u16 = 8003;
pub const DEFAULT_STATUS_PATH_PREFIX: &str = "api/bioquery/runs";

/// Name of the service that accepts run submissions.
pub const EXECUTION_SERVICE: &str = "tes";
/// Name of the service that proxies run status.
pub const STATUS_PROXY_SERVICE: &str = "workbench";

#[derive(Debug, Clone, PartialEq)]
pub struct StackPorts {
    pub tes: u16,
    pub toolserver: u16,
    pub workbench: u16,
    pub limsx: u16,
}

impl Default for StackPorts {
    fn default() -> Self {
        Self {
            tes: DEFAULT_TES_PORT,
            toolserver: DEFAULT_TOOLSERVER_PORT,
            workbench: DEFAULT_WORKBENCH_PORT,
            limsx: DEFAULT_LIMSX_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessConfig {
    /// Attempts per probe; with the default interval this is seconds.
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval: Duration,
    pub status_path_prefix: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            interval: Duration::from_secs(1),
            status_path_prefix: DEFAULT_STATUS_PATH_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub session: String,
    pub host: String,
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub ports: StackPorts,
    pub services: Vec<ServiceSpec>,
    pub readiness: ReadinessConfig,
    pub poll: PollConfig,
    pub reclaim_grace: Duration,
    pub smoke_request_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StackFile {
    #[serde(rename = "service", default)]
    services: Vec<ServiceSpec>,
}

impl StackConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset and empty values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let ports = StackPorts {
            tes: parse_port(&get, "TES_PORT", DEFAULT_TES_PORT)?,
            toolserver: parse_port(&get, "TOOLSERVER_PORT", DEFAULT_TOOLSERVER_PORT)?,
            workbench: parse_port(&get, "WORKBENCH_PORT", DEFAULT_WORKBENCH_PORT)?,
            limsx: parse_port(&get, "LIMSX_PORT", DEFAULT_LIMSX_PORT)?,
        };

        let session = get("SESSION").unwrap_or_else(|| DEFAULT_SESSION.to_string());
        let host = get("STACK_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());

        let root = match get("STACK_ROOT") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };

        let state_dir = match get("STACK_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("devstack"),
        };

        let readiness = ReadinessConfig {
            attempts: parse_num(&get, "READY_TIMEOUT_SECS", 60)?,
            interval: Duration::from_secs(1),
        };

        let poll = PollConfig {
            max_attempts: parse_num(&get, "POLL_MAX_ATTEMPTS", 120)?,
            interval: Duration::from_millis(parse_num(&get, "POLL_INTERVAL_MS", 1000)?),
            status_path_prefix: get("STATUS_PATH_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_STATUS_PATH_PREFIX.to_string()),
        };

        let reclaim_grace = Duration::from_millis(parse_num(&get, "RECLAIM_GRACE_MS", 3000)?);

        let services = match get("STACK_FILE") {
            Some(file) => load_stack_file(Path::new(&file), &host)?,
            None => default_services(&ports, &host),
        };

        let services = services
            .into_iter()
            .map(|mut spec| {
                if spec.working_directory.is_relative() {
                    spec.working_directory = root.join(&spec.working_directory);
                }
                spec
            })
            .collect();

        Ok(Self {
            session,
            host,
            root,
            state_dir,
            ports,
            services,
            readiness,
            poll,
            reclaim_grace,
            smoke_request_file: get("SMOKE_REQUEST_FILE").map(PathBuf::from),
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Base URL of a named service, falling back to the env-configured port.
    pub fn base_url(&self, name: &str) -> String {
        let port = self
            .service(name)
            .map(|s| s.port)
            .unwrap_or(match name {
                "tes" => self.ports.tes,
                "toolserver" => self.ports.toolserver,
                "workbench" => self.ports.workbench,
                _ => self.ports.limsx,
            });
        format!("http://{}:{}", self.host, port)
    }

    pub fn execution_base_url(&self) -> String {
        self.base_url(EXECUTION_SERVICE)
    }

    pub fn status_proxy_base_url(&self) -> String {
        self.base_url(STATUS_PROXY_SERVICE)
    }

    pub fn configured_ports(&self) -> Vec<u16> {
        self.services.iter().map(|s| s.port).collect()
    }
}

fn parse_port<F>(get: &F, key: &str, default: u16) -> Result<u16>
where
    F: Fn(&str) -> Option<String>,
{
    let port = parse_num(get, key, default)?;
    if port == 0 {
        return Err(StackError::Configuration(format!("{key} must be between 1 and 65535")));
    }
    Ok(port)
}

fn parse_num<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| StackError::Configuration(format!("invalid {key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn load_stack_file(path: &Path, host: &str) -> Result<Vec<ServiceSpec>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        StackError::Configuration(format!("cannot read stack file {}: {e}", path.display()))
    })?;
    let file: StackFile = toml::from_str(&text)?;
    if file.services.is_empty() {
        return Err(StackError::Configuration(format!(
            "stack file {} defines no [[service]] entries",
            path.display()
        )));
    }
    Ok(file.services.into_iter().map(|s| render(s, host)).collect())
}

/// Substitute `{port}` and `{host}` in command arguments and environment values.
fn render(mut spec: ServiceSpec, host: &str) -> ServiceSpec {
    let port = spec.port.to_string();
    let fill = |s: &str| s.replace("{port}", &port).replace("{host}", host);
    spec.command = spec.command.iter().map(|a| fill(a.as_str())).collect();
    for value in spec.environment.values_mut() {
        *value = fill(value.as_str());
    }
    spec
}

pub fn default_services(ports: &StackPorts, host: &str) -> Vec<ServiceSpec> {
    let uvicorn = ["uvicorn", "app.main:app", "--host", "{host}", "--port", "{port}"];
    let tes_url = format!("http://{host}:{}", ports.tes);

    vec![
        ServiceSpec::new("tes", "services/tes", &uvicorn, ports.tes)
            .with_env("PORT", "{port}")
            .with_health_path("/health"),
        ServiceSpec::new("toolserver", "services/toolserver", &uvicorn, ports.toolserver)
            .with_env("PORT", "{port}")
            .with_health_path("/health"),
        ServiceSpec::new(
            "workbench",
            "services/workbench",
            &["python", "manage.py", "runserver", "{host}:{port}"],
            ports.workbench,
        )
        .with_env("PORT", "{port}")
        .with_env("TES_BASE_URL", &tes_url)
        .with_health_path("/"),
        ServiceSpec::new("limsx", "services/limsx", &uvicorn, ports.limsx)
            .with_env("PORT", "{port}")
            .with_health_path("/health"),
    ]
    .into_iter()
    .map(|s| render(s, host))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = StackConfig::from_lookup(lookup(&[("STACK_ROOT", "/srv/stack")])).unwrap();

        assert_eq!(config.session, "devstack");
        assert_eq!(config.ports, StackPorts::default());
        assert_eq!(config.poll.max_attempts, 120);
        assert_eq!(config.poll.interval, Duration::from_secs(1));
        assert_eq!(config.services.len(), 4);
        assert_eq!(config.execution_base_url(), "http://127.0.0.1:8000");
        assert_eq!(config.status_proxy_base_url(), "http://127.0.0.1:8002");
    }

    #[test]
    fn test_env_overrides_ports_and_session() {
        let config = StackConfig::from_lookup(lookup(&[
            ("STACK_ROOT", "/srv/stack"),
            ("TES_PORT", "9100"),
            ("WORKBENCH_PORT", "9102"),
            ("SESSION", "smoke"),
        ]))
        .unwrap();

        assert_eq!(config.session, "smoke");
        let tes = config.service("tes").unwrap();
        assert_eq!(tes.port, 9100);
        assert!(tes.command.contains(&"9100".to_string()));
        assert_eq!(tes.working_directory, PathBuf::from("/srv/stack/services/tes"));

        let workbench = config.service("workbench").unwrap();
        assert_eq!(workbench.command.last().unwrap(), "127.0.0.1:9102");
        assert_eq!(
            workbench.environment.get("TES_BASE_URL").unwrap(),
            "http://127.0.0.1:9100"
        );
    }

    #[test]
    fn test_invalid_port_is_configuration_error() {
        let err = StackConfig::from_lookup(lookup(&[("STACK_ROOT", "/"), ("TES_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, StackError::Configuration(ref m) if m.contains("TES_PORT")));

        let err = StackConfig::from_lookup(lookup(&[("STACK_ROOT", "/"), ("LIMSX_PORT", "0")]))
            .unwrap_err();
        assert!(matches!(err, StackError::Configuration(_)));
    }

    #[test]
    fn test_stack_file_replaces_default_services() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stack.toml");
        std::fs::write(
            &file,
            r#"
[[service]]
name = "tes"
working_directory = "tes"
command = ["./serve", "--port", "{port}"]
port = 7000
health_path = "/health"

[service.environment]
BIND = "{host}:{port}"
"#,
        )
        .unwrap();

        let config = StackConfig::from_lookup(lookup(&[
            ("STACK_ROOT", dir.path().to_str().unwrap()),
            ("STACK_FILE", file.to_str().unwrap()),
        ]))
        .unwrap();

        assert_eq!(config.services.len(), 1);
        let tes = &config.services[0];
        assert_eq!(tes.command, vec!["./serve", "--port", "7000"]);
        assert_eq!(tes.environment.get("BIND").unwrap(), "127.0.0.1:7000");
        assert_eq!(tes.working_directory, dir.path().join("tes"));
        assert_eq!(config.execution_base_url(), "http://127.0.0.1:7000");
    }

    #[test]
    fn test_status_prefix_is_trimmed() {
        let config = StackConfig::from_lookup(lookup(&[
            ("STACK_ROOT", "/"),
            ("STATUS_PATH_PREFIX", "/proxy/runs/"),
        ]))
        .unwrap();
        assert_eq!(config.poll.status_path_prefix, "proxy/runs");
    }
}
