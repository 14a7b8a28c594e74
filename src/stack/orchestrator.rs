use crate::config::StackConfig;
use crate::error::{Result, StackError};
use crate::ports::{is_port_free, PortReclaimer, ReclaimOutcome};
use crate::readiness::{checks_for, HealthReport, ReadinessProbe};
use crate::supervisor::{Session, SessionSupervisor, WindowState};
use crate::verifier::{JobRunVerifier, RunRequest, VerificationReport};
use tracing::{info, warn};

/// Result of `up`: the running session and its health.
#[derive(Debug)]
pub struct UpReport {
    pub session: Session,
    pub reclaimed: Vec<(u16, ReclaimOutcome)>,
    pub health: HealthReport,
}

/// Runs the stack lifecycle: reclaim ports, start windows, probe, verify.
pub struct StackOrchestrator {
    config: StackConfig,
    supervisor: SessionSupervisor,
    reclaimer: PortReclaimer,
    probe: ReadinessProbe,
}

impl StackOrchestrator {
    pub fn new(config: StackConfig) -> Self {
        let supervisor = SessionSupervisor::new(&config.state_dir);
        let reclaimer = PortReclaimer::new(config.reclaim_grace);
        let probe = ReadinessProbe::new(config.readiness.attempts, config.readiness.interval);
        Self {
            config,
            supervisor,
            reclaimer,
            probe,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// Reclaim every configured port, one after another.
    pub async fn reclaim_ports(&self) -> Vec<(u16, ReclaimOutcome)> {
        let mut outcomes = Vec::new();
        for port in self.config.configured_ports() {
            let outcome = self.reclaimer.reclaim(port).await;
            if let ReclaimOutcome::StillHeld { pids } = &outcome {
                warn!(port, ?pids, "port still held; the service bind may fail");
            } else if matches!(outcome, ReclaimOutcome::Unverified { .. })
                && !is_port_free(&self.config.host, port).await
            {
                warn!(port, "port is in use and its owner could not be found; the service bind may fail");
            }
            outcomes.push((port, outcome));
        }
        outcomes
    }

    /// Bring the stack up and wait for it to be ready. The windows keep
    /// running after this returns, even if the caller exits.
    pub async fn up(&self) -> Result<UpReport> {
        let specs = &self.config.services;
        // Configuration problems must surface before any listener is touched
        SessionSupervisor::validate(specs)?;
        SessionSupervisor::preflight(specs)?;

        let reclaimed = self.reclaim_ports().await;
        let session = self.supervisor.start(&self.config.session, specs).await?;
        info!(session = %self.config.session, windows = session.record.windows.len(), "session started");

        let health = self.probe.check_all(&checks_for(specs, &self.config.host)).await;

        if !session.is_complete() {
            let mut failed: Vec<_> = session.failed.iter().map(|(name, e)| format!("{name}: {e}")).collect();
            failed.sort();
            return Err(StackError::Process(format!("windows failed to start: {}", failed.join("; "))));
        }
        let health = health.into_result()?;

        Ok(UpReport {
            session,
            reclaimed,
            health,
        })
    }

    pub async fn down(&self) -> Result<usize> {
        let stopped = self.supervisor.stop(&self.config.session).await?;
        info!(session = %self.config.session, windows = stopped, "session destroyed");
        Ok(stopped)
    }

    pub async fn status(&self) -> Result<Vec<WindowState>> {
        self.supervisor.status(&self.config.session).await
    }

    pub fn logs(&self, service: &str, lines: usize) -> Result<Vec<String>> {
        self.supervisor.tail(&self.config.session, service, lines)
    }

    /// Probe the stack, then run the end-to-end job check against it.
    pub async fn smoke(&self) -> Result<VerificationReport> {
        self.probe
            .check_all(&checks_for(&self.config.services, &self.config.host))
            .await
            .into_result()?;

        let request = match &self.config.smoke_request_file {
            Some(path) => RunRequest::from_json_file(path)?,
            None => RunRequest::smoke_default(),
        };

        let verifier = JobRunVerifier::new(
            &self.config.execution_base_url(),
            &self.config.status_proxy_base_url(),
            &self.config.poll,
        );
        verifier.verify(&request).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{PollConfig, ReadinessConfig, StackPorts};
    use crate::supervisor::{ServiceSpec, WindowStatus};
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(dir: &Path, services: Vec<ServiceSpec>) -> StackConfig {
        StackConfig {
            session: "it".into(),
            host: "127.0.0.1".into(),
            root: dir.to_path_buf(),
            state_dir: dir.join("state"),
            ports: StackPorts::default(),
            services,
            readiness: ReadinessConfig {
                attempts: 5,
                interval: Duration::from_millis(20),
            },
            poll: PollConfig {
                max_attempts: 10,
                interval: Duration::from_millis(5),
                ..PollConfig::default()
            },
            reclaim_grace: Duration::from_millis(200),
            smoke_request_file: None,
        }
    }

    #[tokio::test]
    async fn test_up_smoke_down() {
        let dir = tempfile::tempdir().unwrap();
        // The mock servers stand in for the service listeners; the windows
        // themselves are placeholders.
        let tes = MockServer::start().await;
        let workbench = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/runs/validate"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&tes)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/runs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"run_id": "run_42"})))
            .mount(&tes)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/bioquery/runs/run_42/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "COMPLETED",
                "bioquery": {"payload": {"rows": [{"term": "a"}, {"term": "b"}, {"term": "c"}]}}
            })))
            .mount(&workbench)
            .await;

        let services = vec![
            ServiceSpec::new("tes", dir.path(), &["sleep", "30"], tes.address().port()).with_health_path("/health"),
            ServiceSpec::new("workbench", dir.path(), &["sleep", "30"], workbench.address().port()),
        ];
        let orchestrator = StackOrchestrator::new(config(dir.path(), services));

        let up = orchestrator.up().await.unwrap();
        assert!(up.health.is_healthy());
        assert_eq!(up.session.record.windows.len(), 2);
        // Our own listeners are never reclaimed
        assert!(up.reclaimed.iter().all(|(_, o)| !matches!(o, ReclaimOutcome::Freed { .. })));

        let states = orchestrator.status().await.unwrap();
        assert!(states.iter().all(|w| w.status == WindowStatus::Running));

        let report = orchestrator.smoke().await.unwrap();
        assert_eq!(report.run_id, "run_42");
        assert_eq!(report.row_count, 3);

        assert_eq!(orchestrator.down().await.unwrap(), 2);
        assert!(orchestrator.status().await.is_err());
    }

    #[tokio::test]
    async fn test_up_fails_when_required_port_never_listens() {
        let dir = tempfile::tempdir().unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let services = vec![ServiceSpec::new("tes", dir.path(), &["sleep", "30"], port)];
        let orchestrator = StackOrchestrator::new(config(dir.path(), services));

        let err = orchestrator.up().await.unwrap_err();
        assert!(matches!(err, StackError::NotReady { attempts: 5, .. }));

        // The window is left for `down` to clean up
        assert_eq!(orchestrator.down().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ports_fail_before_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![
            ServiceSpec::new("tes", dir.path(), &["sleep", "30"], 9400),
            ServiceSpec::new("limsx", dir.path(), &["sleep", "30"], 9400),
        ];
        let orchestrator = StackOrchestrator::new(config(dir.path(), services));

        let err = orchestrator.up().await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!dir.path().join("state").exists());
    }

    async fn wait_listening(port: u16) -> bool {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_missing_command_leaves_running_listener_alone() {
        let dir = tempfile::tempdir().unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let script = format!(
            "import socket, time\n\
             s = socket.socket()\n\
             s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             s.bind(('127.0.0.1', {port}))\n\
             s.listen()\n\
             time.sleep(30)\n"
        );
        // A listener owned by another process, as a running stack would be
        let Ok(mut listener) = std::process::Command::new("python3").args(["-c", script.as_str()]).spawn() else {
            return;
        };
        assert!(wait_listening(port).await);

        let services = vec![ServiceSpec::new("tes", dir.path(), &["no-such-binary-devstack"], port)];
        let orchestrator = StackOrchestrator::new(config(dir.path(), services));

        let err = orchestrator.up().await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(listener.try_wait().unwrap().is_none(), "listener was killed by a failed up");

        listener.kill().unwrap();
        listener.wait().unwrap();
    }
}
