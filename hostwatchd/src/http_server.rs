//! Local control API: health, journal retrieval and command submission.

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::context::{HealthReport, ServiceContext};
use crate::queue::QueueError;

pub const COMMAND_ADDED: &str = "Command added to queue";

/// Body of `POST /add-command`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid request")]
    Malformed,
    #[error("Command cannot be empty")]
    Empty,
}

impl CommandRequest {
    pub fn parse(body: &[u8]) -> Result<String, ValidationError> {
        let request: CommandRequest =
            serde_json::from_slice(body).map_err(|_| ValidationError::Malformed)?;
        match request.command {
            Some(command) if !command.trim().is_empty() => Ok(command),
            _ => Err(ValidationError::Empty),
        }
    }
}

#[derive(Clone)]
struct ApiState {
    ctx: Arc<ServiceContext>,
    cancel: CancellationToken,
}

enum ApiError {
    Validation(ValidationError),
    Queue(QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(err) => {
                debug!(%err, "Rejected command submission");
                (StatusCode::BAD_REQUEST, format!("{}\n", err)).into_response()
            }
            ApiError::Queue(QueueError::Cancelled) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service is stopping\n".to_string(),
            )
                .into_response(),
            ApiError::Queue(err) => {
                warn!(%err, "Command queue unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Command queue unavailable: {}\n", err),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(ctx: Arc<ServiceContext>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/logs", get(logs))
        .route("/add-command", post(add_command))
        .layer(Extension(ApiState { ctx, cancel }))
        .layer(TraceLayer::new_for_http())
}

/// Serves the API on `listener` until `cancel` fires, then drains
/// in-flight requests.
pub fn serve(
    listener: TcpListener,
    ctx: Arc<ServiceContext>,
    cancel: CancellationToken,
) -> JoinHandle<io::Result<()>> {
    let app = router(ctx, cancel.clone());
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    })
}

async fn health(Extension(state): Extension<ApiState>) -> Json<HealthReport> {
    Json(state.ctx.status().report())
}

async fn logs(Extension(state): Extension<ApiState>) -> Json<Vec<String>> {
    Json(state.ctx.log().snapshot())
}

async fn add_command(
    Extension(state): Extension<ApiState>,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let command = CommandRequest::parse(&body).map_err(ApiError::Validation)?;
    state
        .ctx
        .enqueue_command(command, &state.cancel)
        .await
        .map_err(ApiError::Queue)?;
    state.ctx.log().info(COMMAND_ADDED);
    Ok("Command added to queue\n")
}
