use super::types::*;
use crate::error::{Result, StackError};
use crate::supervisor::ServiceSpec;
use futures::future::join_all;
use reqwest::Client;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

/// Polls ports and HTTP endpoints at a fixed interval until they answer.
pub struct ReadinessProbe {
    client: Client,
    interval: Duration,
    attempts: u32,
}

impl ReadinessProbe {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            interval,
            attempts: attempts.max(1),
        }
    }

    /// Succeeds once something accepts connections on `host:port`.
    pub async fn await_tcp(&self, host: &str, port: u16) -> Result<Ready> {
        let target = ProbeTarget::Tcp { host: host.to_string(), port };
        self.poll(&target, move || async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            }
        })
        .await
    }

    /// Succeeds once a GET returns any HTTP response; only transport errors retry.
    pub async fn await_http(&self, url: &str) -> Result<Ready> {
        let target = ProbeTarget::Http { url: url.to_string() };
        self.poll(&target, move || async move {
            self.client
                .get(url)
                .send()
                .await
                .map(|response| debug!(url, status = %response.status(), "http probe answered"))
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn check(&self, check: &HealthCheck) -> CheckOutcome {
        let result = match &check.target {
            ProbeTarget::Tcp { host, port } => self.await_tcp(host, *port).await,
            ProbeTarget::Http { url } => self.await_http(url).await,
        };
        match (&result, check.policy) {
            (Ok(ready), _) => info!(service = %check.service, endpoint = %ready.target, attempts = ready.attempts, "ready"),
            (Err(e), CheckPolicy::Tolerated) => info!(service = %check.service, error = %e, "tolerated check failed"),
            (Err(e), CheckPolicy::Required) => warn!(service = %check.service, error = %e, "required check failed"),
        }
        CheckOutcome { check: check.clone(), result }
    }

    /// Run all checks concurrently. A failing check never cuts the others short.
    pub async fn check_all(&self, checks: &[HealthCheck]) -> HealthReport {
        let outcomes = join_all(checks.iter().map(|c| self.check(c))).await;
        HealthReport { outcomes }
    }

    /// Attempts run at `interval` until one succeeds or the overall budget of
    /// `interval * attempts` is spent. A slow attempt is cut off at the deadline.
    async fn poll<F, Fut>(&self, target: &ProbeTarget, mut attempt: F) -> Result<Ready>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), String>>,
    {
        let started = Instant::now();
        let deadline = started + self.interval * self.attempts;
        for n in 1..=self.attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let tried = Instant::now();
            match tokio::time::timeout(remaining, attempt()).await {
                Ok(Ok(())) => {
                    return Ok(Ready {
                        target: target.to_string(),
                        attempts: n,
                        elapsed: started.elapsed(),
                    })
                }
                Ok(Err(reason)) => debug!(probe = %target, attempt = n, %reason, "not ready yet"),
                Err(_) => debug!(probe = %target, attempt = n, "attempt hit the deadline"),
            }
            if n < self.attempts {
                let next = (tried + self.interval).min(deadline);
                tokio::time::sleep_until(next).await;
            }
        }
        Err(StackError::NotReady {
            target: target.to_string(),
            attempts: self.attempts,
        })
    }
}

/// A Required port check for every service, plus a Tolerated HTTP check
/// where a health path is configured: a listening port is enough.
pub fn checks_for(specs: &[ServiceSpec], host: &str) -> Vec<HealthCheck> {
    let mut checks = Vec::new();
    for spec in specs {
        checks.push(HealthCheck {
            service: spec.name.clone(),
            target: ProbeTarget::Tcp { host: host.to_string(), port: spec.port },
            policy: CheckPolicy::Required,
        });
        if let Some(path) = &spec.health_path {
            let path = if path.starts_with('/') { path.clone() } else { format!("/{path}") };
            checks.push(HealthCheck {
                service: spec.name.clone(),
                target: ProbeTarget::Http { url: format!("http://{host}:{}{path}", spec.port) },
                policy: CheckPolicy::Tolerated,
            });
        }
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_tcp_ready_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = ReadinessProbe::new(3, Duration::from_millis(50));
        let ready = assert_ok!(probe.await_tcp("127.0.0.1", port).await);
        assert_eq!(ready.attempts, 1);
    }

    #[tokio::test]
    async fn test_tcp_times_out_after_attempts() {
        let port = unused_port();
        let probe = ReadinessProbe::new(5, Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = assert_err!(probe.await_tcp("127.0.0.1", port).await);
        let elapsed = started.elapsed();

        assert!(matches!(err, StackError::NotReady { attempts: 5, .. }));
        assert!(err.to_string().contains(&format!("tcp://127.0.0.1:{port}")));
        // four sleeps between five attempts
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_tcp_ready_once_listener_appears() {
        let port = unused_port();
        let probe = ReadinessProbe::new(20, Duration::from_millis(50));

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        let ready = assert_ok!(probe.await_tcp("127.0.0.1", port).await);
        assert!(ready.attempts > 1);
        server.abort();
    }

    #[tokio::test]
    async fn test_http_any_status_is_reachable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let probe = ReadinessProbe::new(2, Duration::from_millis(10));
        let url = format!("{}/health", mock_server.uri());
        let ready = assert_ok!(probe.await_http(&url).await);
        assert_eq!(ready.attempts, 1);
        assert_eq!(ready.target, url);
    }

    #[tokio::test]
    async fn test_http_hung_endpoint_gives_up_within_budget() {
        // Accepts connections through the backlog but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/health", listener.local_addr().unwrap());
        let probe = ReadinessProbe::new(3, Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = assert_err!(probe.await_http(&url).await);
        let elapsed = started.elapsed();

        assert!(matches!(err, StackError::NotReady { attempts: 3, .. }));
        assert!(elapsed >= Duration::from_millis(250), "gave up early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "overran the budget: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_http_connection_refused_is_not_ready() {
        let url = format!("http://127.0.0.1:{}/health", unused_port());
        let probe = ReadinessProbe::new(3, Duration::from_millis(10));

        let err = assert_err!(probe.await_http(&url).await);
        assert!(matches!(err, StackError::NotReady { ref target, attempts: 3 } if *target == url));
    }

    #[tokio::test]
    async fn test_tolerated_http_failure_keeps_stack_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // A bare listener accepts the TCP probe but never answers HTTP
        let spec = ServiceSpec::new("tes", "/", &["x"], port).with_health_path("health");
        let checks = checks_for(&[spec], "127.0.0.1");

        assert_eq!(checks.len(), 2);
        assert_eq!(
            checks[1].target,
            ProbeTarget::Http { url: format!("http://127.0.0.1:{port}/health") }
        );

        let probe = ReadinessProbe::new(2, Duration::from_millis(10));
        let report = probe.check_all(&checks).await;

        assert!(report.is_healthy());
        assert_eq!(report.tolerated_failures().count(), 1);
        assert_ok!(report.into_result());
    }

    #[tokio::test]
    async fn test_one_dead_service_does_not_abort_others() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().port();
        let dead = unused_port();
        let specs = vec![
            ServiceSpec::new("dead", "/", &["x"], dead),
            ServiceSpec::new("live", "/", &["x"], live),
        ];

        let probe = ReadinessProbe::new(3, Duration::from_millis(20));
        let report = probe.check_all(&checks_for(&specs, "127.0.0.1")).await;

        assert!(!report.is_healthy());
        assert!(report.outcomes.iter().any(|o| o.check.service == "live" && o.is_ready()));
        let err = assert_err!(report.into_result());
        assert!(err.to_string().contains(&dead.to_string()));
    }
}
