mod common;

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use hostwatchd::{
    ConfigError, ConfigSource, LoopStatus, ServiceController, ServiceState, StartError,
};
use tempfile::TempDir;

use common::{agent_config, client_for, collector, controller};

#[tokio::test]
async fn health_follows_start_and_stop() {
    let (endpoint, _) = collector(StatusCode::OK).await;
    let service = controller(agent_config(&endpoint), &[]);

    service.start().await.unwrap();
    let client = client_for(&service).await;
    let health = client.health().await.unwrap();
    assert!(health.all_running(), "unexpected health {health:?}");

    service.stop().await.unwrap();
    let report = service.context().status().report();
    assert_eq!(report.worker, LoopStatus::Stopped);
    assert_eq!(report.timer, LoopStatus::Stopped);
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let (endpoint, _) = collector(StatusCode::OK).await;
    let service = controller(agent_config(&endpoint), &[]);

    service.start().await.unwrap();
    let addr = service.local_addr().await;
    service.start().await.unwrap();
    assert_eq!(service.local_addr().await, addr, "second start must not rebind");

    service.stop().await.unwrap();
    service.stop().await.unwrap();

    let messages: Vec<String> = service
        .context()
        .log()
        .entries()
        .into_iter()
        .map(|entry| entry.message)
        .collect();
    let count = |text: &str| messages.iter().filter(|m| m.as_str() == text).count();
    assert_eq!(count("Service is already running"), 1);
    assert_eq!(count("Service started"), 1);
    assert_eq!(count("Worker stopped"), 1);
    assert_eq!(count("Timer stopped"), 1);
    assert_eq!(count("Service stopped"), 1);
    assert_eq!(count("No service running"), 1);
}

#[tokio::test]
async fn missing_config_file_fails_closed() {
    let dir = TempDir::new().unwrap();
    let service = ServiceController::builder(ConfigSource::File(dir.path().join("absent.toml")))
        .handle_signals(false)
        .build();

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, StartError::Config(ConfigError::Missing { .. })));
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(service.local_addr().await.is_none());
    assert!(service.context().log().contains("Error loading config:"));
    assert!(!service.context().log().contains("Service started"));
    assert_eq!(service.context().status().worker(), LoopStatus::Stopped);
}

#[tokio::test]
async fn config_file_is_read_on_every_start() {
    let (endpoint, _) = collector(StatusCode::OK).await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hostwatch.toml");
    std::fs::write(
        &path,
        format!(
            "[service]\nhost = \"127.0.0.1\"\nport = 0\nfrequency_minutes = 1\ndirectory = \"/srv\"\nendpoint = \"{endpoint}\"\n\n[scan]\nbinary = \"/nonexistent/osqueryi\"\n"
        ),
    )
    .unwrap();

    let service = ServiceController::builder(ConfigSource::File(path.clone()))
        .handle_signals(false)
        .build();
    service.start().await.unwrap();
    service.stop().await.unwrap();

    std::fs::write(&path, "[service]\nport = \"not a number\"\n").unwrap();
    let err = service.start().await.unwrap_err();
    assert!(matches!(err, StartError::Config(ConfigError::Parse { .. })));
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn stop_does_not_wait_out_the_scan_period() {
    let (endpoint, _) = collector(StatusCode::OK).await;
    let service = controller(agent_config(&endpoint), &["a.txt"]);

    service.start().await.unwrap();
    common::wait_for_log(service.context(), "Data collected!").await;

    let began = Instant::now();
    service.stop().await.unwrap();
    assert!(
        began.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        began.elapsed()
    );
}

#[cfg(unix)]
#[tokio::test]
async fn service_can_restart_and_keeps_its_journal() {
    let (endpoint, _) = collector(StatusCode::OK).await;
    let service = controller(agent_config(&endpoint), &[]);

    service.start().await.unwrap();
    service.stop().await.unwrap();
    let before = service.context().log().len();

    service.start().await.unwrap();
    let client = client_for(&service).await;
    assert!(client.health().await.unwrap().all_running());
    client.add_command("echo again").await.unwrap();
    common::wait_for_log(service.context(), "Command executed successfully: echo again").await;

    service.stop().await.unwrap();
    assert!(service.context().log().len() > before);
}
