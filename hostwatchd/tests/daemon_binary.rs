#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use hostwatchd_client::ControlClient;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

fn daemon() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_hostwatchd"));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn exits_with_error_when_config_is_missing() {
    let dir = TempDir::new().unwrap();
    let output = daemon()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .output()
        .await
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to start hostwatch service"),
        "stderr: {stderr}"
    );
}

/// Writes a config for an agent on `port` with no reachable scanner.
fn write_config(dir: &TempDir, port: u16) -> PathBuf {
    let config = dir.path().join("hostwatch.toml");
    std::fs::write(
        &config,
        format!(
            "[service]\nhost = \"127.0.0.1\"\nport = {port}\nfrequency_minutes = 60\ndirectory = \"/srv\"\nendpoint = \"http://127.0.0.1:9/api\"\n\n[worker]\nshell = \"sh\"\n\n[scan]\nbinary = \"/nonexistent/osqueryi\"\n"
        ),
    )
    .unwrap();
    config
}

fn spawn_agent(config: &Path) -> Child {
    daemon()
        .env_remove("HOSTWATCH_PORT")
        .env_remove("HOSTWATCH_ENDPOINT")
        .stderr(Stdio::null())
        .arg("--config")
        .arg(config)
        .spawn()
        .unwrap()
}

/// Waits until the agent has journaled its start.
async fn wait_until_started(client: &ControlClient) {
    for _ in 0..100 {
        if let Ok(lines) = client.logs().await {
            if lines.iter().any(|line| line.contains("Service started")) {
                return;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon never reported a started service");
}

#[tokio::test]
async fn runs_until_told_to_stop() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = write_config(&dir, port);
    let mut child = spawn_agent(&config);

    let client = ControlClient::new(format!("http://127.0.0.1:{port}")).unwrap();
    wait_until_started(&client).await;
    assert!(client.health().await.unwrap().all_running());

    client.add_command("echo from-binary").await.unwrap();
    client.stop().await.unwrap();

    let status = timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("daemon should exit after stop")
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn exits_cleanly_on_sigterm() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = write_config(&dir, port);
    let mut child = spawn_agent(&config);

    let client = ControlClient::new(format!("http://127.0.0.1:{port}")).unwrap();
    wait_until_started(&client).await;
    // Give the supervisor time to install its signal handlers.
    sleep(Duration::from_millis(200)).await;

    let pid = child.id().unwrap().to_string();
    let kill = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(&pid)
        .status()
        .unwrap();
    assert!(kill.success());

    let status = timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("daemon should exit after SIGTERM")
        .unwrap();
    assert!(status.success(), "status: {status:?}");
    assert!(client.health().await.is_err());
}
