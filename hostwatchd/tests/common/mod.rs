#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use hostwatchd::{
    AgentConfig, ConfigSource, ReportPayload, ScanError, Scanner, ServiceContext,
    ServiceController,
};
use hostwatchd_client::ControlClient;
use tokio::net::TcpListener;

/// Scanner that always finds the same files.
pub struct FixedScanner(pub Vec<String>);

#[async_trait]
impl Scanner for FixedScanner {
    async fn scan(&self, _directory: &str) -> Result<Vec<String>, ScanError> {
        Ok(self.0.clone())
    }
}

pub type Received = Arc<Mutex<Vec<ReportPayload>>>;

/// Report endpoint answering every POST with `status`.
pub async fn collector(status: StatusCode) -> (String, Received) {
    let received: Received = Arc::default();
    let app = Router::new()
        .route(
            "/api",
            post(
                move |Extension(store): Extension<Received>, Json(body): Json<ReportPayload>| async move {
                    store.lock().unwrap().push(body);
                    status
                },
            ),
        )
        .layer(Extension(Arc::clone(&received)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (format!("http://{addr}/api"), received)
}

/// Loopback, ephemeral port, one-minute period, `sh` as the shell.
pub fn agent_config(endpoint: &str) -> AgentConfig {
    let mut config = AgentConfig::new(0, Duration::from_secs(60), "/srv/watched", endpoint);
    config.host = "127.0.0.1".into();
    config.shell = "sh".into();
    config.shutdown_grace = Duration::from_secs(5);
    config
}

pub fn controller(config: AgentConfig, files: &[&str]) -> Arc<ServiceController> {
    ServiceController::builder(ConfigSource::Inline(config))
        .handle_signals(false)
        .scanner(Arc::new(FixedScanner(
            files.iter().map(|f| f.to_string()).collect(),
        )))
        .build()
}

pub async fn client_for(controller: &ServiceController) -> ControlClient {
    let addr: SocketAddr = controller.local_addr().await.expect("service is running");
    ControlClient::new(format!("http://{addr}")).unwrap()
}

pub async fn wait_for_log(ctx: &ServiceContext, needle: &str) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while !ctx.log().contains(needle) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        found.is_ok(),
        "journal never contained {needle:?}: {:#?}",
        ctx.log().snapshot()
    );
}
