// ABOUTME: Integration tests for the HealthChecker.
// ABOUTME: Covers the all-or-nothing wait, vacuous success, and both check families.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{closed_port, spawn_http_responder, MockExecutor, HTTP_OK, HTTP_SERVER_ERROR};

use stevedore::health::{HealthCheck, HealthChecker};
use stevedore::proxy::HealthCheckSpec;

fn checker(executor: Arc<MockExecutor>) -> HealthChecker {
    HealthChecker::new(executor).with_interval(Duration::from_millis(20))
}

fn http_check(port: u16, status: Option<u16>) -> HealthCheck {
    let spec = HealthCheckSpec {
        path: "/health".to_string(),
        hostname: Some("127.0.0.1".to_string()),
        port: Some(port),
        status,
        ..Default::default()
    };
    HealthCheck::http_for_backend("http://web:8080", &spec).unwrap()
}

/// Test: an empty check set succeeds immediately (vacuous truth).
#[tokio::test]
async fn empty_check_set_is_immediate_success() {
    let executor = Arc::new(MockExecutor::new());
    let health = checker(executor.clone());

    tokio::time::timeout(Duration::from_millis(50), health.wait_for_all(&[]))
        .await
        .expect("empty set must complete at once");
    assert_eq!(executor.command_count(), 0, "no probes for an empty set");
}

/// Test: two healthy checks and one unhealthy never signal success;
/// once the third reports healthy, success fires on the next tick.
#[tokio::test]
async fn all_or_nothing_waits_for_every_check() {
    let executor = Arc::new(MockExecutor::new());
    executor.set_health("a", "healthy");
    executor.set_health("b", "running");
    executor.set_health("c", "starting");
    let health = checker(executor.clone());

    let checks = vec![
        HealthCheck::container("a"),
        HealthCheck::container("b"),
        HealthCheck::container("c"),
    ];

    let partial =
        tokio::time::timeout(Duration::from_millis(200), health.wait_for_all(&checks)).await;
    assert!(partial.is_err(), "partial health must never signal success");

    executor.set_health("c", "healthy");
    tokio::time::timeout(Duration::from_secs(2), health.wait_for_all(&checks))
        .await
        .expect("all healthy must complete");
}

/// Test: a container with no health command is ready when running.
#[tokio::test]
async fn running_container_without_health_command_is_ready() {
    let executor = Arc::new(MockExecutor::new());
    executor.set_health("plain", "running");
    let health = checker(executor.clone());

    assert!(health.check(&HealthCheck::container("plain")).await);
}

/// Test: a missing container counts as unhealthy for the tick, not a crash.
#[tokio::test]
async fn missing_container_is_unhealthy() {
    let executor = Arc::new(MockExecutor::new());
    let health = checker(executor);

    assert!(!health.check(&HealthCheck::container("ghost")).await);
}

/// Test: an HTTP check accepts any 2xx when no explicit status is declared.
#[tokio::test]
async fn http_check_accepts_2xx() {
    let addr = spawn_http_responder(HTTP_OK).await;
    let executor = Arc::new(MockExecutor::new());
    let health = checker(executor);

    assert!(health.check(&http_check(addr.port(), None)).await);
}

/// Test: a non-2xx response is unhealthy without an expected status.
#[tokio::test]
async fn http_check_rejects_server_error() {
    let addr = spawn_http_responder(HTTP_SERVER_ERROR).await;
    let executor = Arc::new(MockExecutor::new());
    let health = checker(executor);

    assert!(!health.check(&http_check(addr.port(), None)).await);
}

/// Test: an explicit expected status must match exactly.
#[tokio::test]
async fn http_check_honors_expected_status() {
    let addr = spawn_http_responder(HTTP_SERVER_ERROR).await;
    let executor = Arc::new(MockExecutor::new());
    let health = checker(executor);

    assert!(health.check(&http_check(addr.port(), Some(500))).await);
    assert!(!health.check(&http_check(addr.port(), Some(200))).await);
}

/// Test: a connection-refused backend is unhealthy, not an error.
#[tokio::test]
async fn unreachable_backend_is_unhealthy() {
    let port = closed_port().await;
    let executor = Arc::new(MockExecutor::new());
    let health = checker(executor);

    assert!(!health.check(&http_check(port, None)).await);
}

/// Test: mixed container and HTTP checks gate together.
#[tokio::test]
async fn mixed_families_gate_together() {
    let addr = spawn_http_responder(HTTP_OK).await;
    let executor = Arc::new(MockExecutor::new());
    executor.set_health("web-v1", "starting");
    let health = checker(executor.clone());

    let checks = vec![
        HealthCheck::container("web-v1"),
        http_check(addr.port(), None),
    ];

    let partial =
        tokio::time::timeout(Duration::from_millis(150), health.wait_for_all(&checks)).await;
    assert!(partial.is_err(), "unhealthy container must hold the gate");

    executor.set_health("web-v1", "healthy");
    tokio::time::timeout(Duration::from_secs(2), health.wait_for_all(&checks))
        .await
        .expect("both families healthy must complete");
}
