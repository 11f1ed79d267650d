// ABOUTME: Health checking for containers and HTTP endpoints.
// ABOUTME: wait_for_all polls every check each tick and succeeds only when all pass at once.

use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::exec::{quote, Executor};
use crate::proxy::{parse_backend_url, HealthCheckSpec, ProxyError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// One readiness condition to poll.
#[derive(Debug, Clone)]
pub enum HealthCheck {
    /// Poll the runtime until the named container reports running/healthy.
    Container { name: String },
    /// Issue an HTTP request and accept the expected status, or any 2xx.
    Http(HttpCheck),
}

impl HealthCheck {
    pub fn container(name: impl Into<String>) -> Self {
        Self::Container { name: name.into() }
    }

    /// Build an HTTP check for one load-balancer backend, honoring the
    /// declared health-check descriptor's overrides. The backend URL must be
    /// `host:port`; anything else is a validation error.
    pub fn http_for_backend(
        url: &str,
        spec: &HealthCheckSpec,
    ) -> std::result::Result<Self, ProxyError> {
        let (host, port) = parse_backend_url(url)?;
        Ok(Self::Http(HttpCheck {
            host: spec.hostname.clone().unwrap_or(host),
            port: spec.port.unwrap_or(port),
            path: spec.path.clone(),
            method: spec.method.clone().unwrap_or_else(|| "GET".to_string()),
            expect_status: spec.status,
            headers: spec.headers.clone().into_iter().collect(),
            timeout: spec.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct HttpCheck {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub method: String,
    /// Explicit expected status; None accepts any 2xx.
    pub expect_status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Polls container status and HTTP endpoints until readiness holds.
#[derive(Clone)]
pub struct HealthChecker {
    executor: Arc<dyn Executor>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait until every check reports healthy in the same polling tick.
    ///
    /// There is no partial-success state: some healthy is treated the same
    /// as none healthy, and polling continues. An empty check set succeeds
    /// immediately. This polls indefinitely - the caller bounds it with a
    /// timeout or cancellation.
    pub async fn wait_for_all(&self, checks: &[HealthCheck]) {
        if checks.is_empty() {
            return;
        }

        loop {
            let probes = checks.iter().map(|check| self.check(check));
            let results = futures::future::join_all(probes).await;

            if results.iter().all(|healthy| *healthy) {
                return;
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Probe a single check once. Errors count as unhealthy for this tick;
    /// the poll loop retries until the caller's deadline.
    pub async fn check(&self, check: &HealthCheck) -> bool {
        match check {
            HealthCheck::Container { name } => self.check_container(name).await,
            HealthCheck::Http(http) => Self::check_http(http).await,
        }
    }

    async fn check_container(&self, name: &str) -> bool {
        // containers without a declared health command report their run state
        let command = format!(
            "docker inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{else}}}}{{{{.State.Status}}}}{{{{end}}}}' {}",
            quote(name)
        );

        match self.executor.exec(&command).await {
            Ok(output) if output.success() => {
                let status = output.stdout.trim();
                status == "healthy" || status == "running"
            }
            Ok(output) => {
                tracing::debug!(container = name, stderr = %output.stderr.trim(), "inspect failed");
                false
            }
            Err(err) => {
                tracing::debug!(container = name, error = %err, "inspect errored");
                false
            }
        }
    }

    async fn check_http(check: &HttpCheck) -> bool {
        match tokio::time::timeout(check.timeout, Self::http_probe(check)).await {
            Ok(Ok(status)) => match check.expect_status {
                Some(expected) => status == expected,
                None => (200..300).contains(&status),
            },
            Ok(Err(err)) => {
                tracing::debug!(host = %check.host, port = check.port, error = %err, "http probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(host = %check.host, port = check.port, "http probe timed out");
                false
            }
        }
    }

    async fn http_probe(
        check: &HttpCheck,
    ) -> std::result::Result<u16, Box<dyn std::error::Error + Send + Sync>> {
        let stream = TcpStream::connect((check.host.as_str(), check.port)).await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("health check connection error: {}", e);
            }
        });

        let mut builder = hyper::Request::builder()
            .method(check.method.as_str())
            .uri(check.path.as_str())
            .header("Host", check.host.as_str());
        for (name, value) in &check.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder.body(Empty::<bytes::Bytes>::new())?;

        let response = sender.send_request(request).await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_check_applies_spec_overrides() {
        let spec = HealthCheckSpec {
            path: "/health".to_string(),
            hostname: Some("127.0.0.1".to_string()),
            port: Some(9999),
            status: Some(204),
            ..Default::default()
        };
        let check = HealthCheck::http_for_backend("http://web:8080", &spec).unwrap();
        match check {
            HealthCheck::Http(http) => {
                assert_eq!(http.host, "127.0.0.1");
                assert_eq!(http.port, 9999);
                assert_eq!(http.method, "GET");
                assert_eq!(http.expect_status, Some(204));
            }
            _ => panic!("expected HTTP check"),
        }
    }

    #[test]
    fn http_check_defaults_to_backend_address() {
        let spec = HealthCheckSpec {
            path: "/".to_string(),
            ..Default::default()
        };
        let check = HealthCheck::http_for_backend("http://web-v2:8080", &spec).unwrap();
        match check {
            HealthCheck::Http(http) => {
                assert_eq!(http.host, "web-v2");
                assert_eq!(http.port, 8080);
                assert_eq!(http.timeout, DEFAULT_HTTP_TIMEOUT);
            }
            _ => panic!("expected HTTP check"),
        }
    }

    #[test]
    fn http_check_rejects_malformed_backend() {
        let spec = HealthCheckSpec {
            path: "/".to_string(),
            ..Default::default()
        };
        assert!(HealthCheck::http_for_backend("not-a-backend", &spec).is_err());
    }
}
