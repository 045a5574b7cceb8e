//! End-to-end tests against a real Docker daemon.
//!
//! These run actual containers from the configured Python image, so they are
//! ignored by default; run them with `cargo test -- --ignored` on a host
//! with Docker and the image available.

use classbox::{Classification, Orchestrator, OrchestratorConfig};

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent: 2,
        per_identity_cap: 2,
        queue_wait_secs: 30,
        execution_timeout_secs: 10,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn prints_arithmetic_result() {
    let orchestrator = Orchestrator::with_docker(&test_config()).await.unwrap();

    let result = orchestrator
        .submit("student-1", "print(2+2)", None)
        .await
        .unwrap();

    assert_eq!(result.classification, Classification::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "4\n");
    assert!(result.stderr.is_empty());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn reads_stdin_payload() {
    let orchestrator = Orchestrator::with_docker(&test_config()).await.unwrap();

    let result = orchestrator
        .submit(
            "student-1",
            "name = input()\nprint(f\"Hello, {name}!\")",
            Some("Ada".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(result.classification, Classification::Completed);
    assert_eq!(result.stdout.trim(), "Hello, Ada!");
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn infinite_loop_times_out() {
    let mut config = test_config();
    config.execution_timeout_secs = 2;
    let orchestrator = Orchestrator::with_docker(&config).await.unwrap();

    let started = std::time::Instant::now();
    let result = orchestrator
        .submit("student-1", "while True: pass", None)
        .await
        .unwrap();

    assert_eq!(result.classification, Classification::TimedOut);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(orchestrator.available_slots(), 2);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn oversized_allocation_is_resource_killed() {
    let orchestrator = Orchestrator::with_docker(&test_config()).await.unwrap();

    // ~500MB against the default 48MiB ceiling.
    let source = "data = []\nwhile True:\n    data.append(' ' * 1024 * 1024)";
    let result = orchestrator.submit("student-1", source, None).await.unwrap();

    assert_eq!(result.classification, Classification::ResourceKilled);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn network_is_unreachable_from_inside() {
    let orchestrator = Orchestrator::with_docker(&test_config()).await.unwrap();

    let source = r#"
import socket
try:
    socket.create_connection(("93.184.216.34", 80), timeout=2)
    print("connected")
except OSError as e:
    print(f"blocked: {e}")
"#;
    let result = orchestrator.submit("student-1", source, None).await.unwrap();

    // The connection failure belongs to the user's code, not the infra.
    assert_eq!(result.classification, Classification::Completed);
    assert!(result.stdout.contains("blocked"));
    assert!(!result.stdout.contains("connected"));
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn root_filesystem_is_read_only() {
    let orchestrator = Orchestrator::with_docker(&test_config()).await.unwrap();

    let source = r#"
try:
    open("/etc/owned", "w").write("x")
    print("wrote")
except OSError as e:
    print(f"denied: {e}")
"#;
    let result = orchestrator.submit("student-1", source, None).await.unwrap();

    assert_eq!(result.classification, Classification::Completed);
    assert!(result.stdout.contains("denied"));
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn crash_reports_completed_with_nonzero_exit() {
    let orchestrator = Orchestrator::with_docker(&test_config()).await.unwrap();

    let result = orchestrator
        .submit("student-1", "raise RuntimeError('boom')", None)
        .await
        .unwrap();

    assert_eq!(result.classification, Classification::Completed);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.stderr.contains("RuntimeError"));
}
