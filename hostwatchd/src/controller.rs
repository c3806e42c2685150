//! Service lifecycle.
//!
//! [`ServiceController`] owns the shared [`ServiceContext`] and is the only
//! thing allowed to move the service between `Stopped` and `Running`. Each
//! run gets its own cancellation token, listener, worker, timer and
//! supervisor; `stop()` tears all of them down within the configured grace
//! period.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AgentConfig, ConfigError, ConfigSource};
use crate::context::{LoopStatus, ServiceContext};
use crate::http_server;
use crate::outcome::fault_message;
use crate::report::{HttpReporter, ReportError, Reporter};
use crate::scan::{OsqueryScanner, Scanner};
use crate::timer::{ScanSchedule, ScanTimer};
use crate::worker::{CommandRunner, CommandWorker, ShellExecutor, StopRequest};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to build report client: {0}")]
    Reporter(#[from] ReportError),
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("listener did not shut down within {0:?}")]
    Deadline(Duration),
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
    #[error("listener task failed: {0}")]
    ListenerTask(String),
}

/// Test and embedding overrides; `None` means "build from config".
#[derive(Default)]
struct Collaborators {
    scanner: Option<Arc<dyn Scanner>>,
    reporter: Option<Arc<dyn Reporter>>,
    runner: Option<Arc<dyn CommandRunner>>,
}

impl Collaborators {
    fn resolve(
        &self,
        config: &AgentConfig,
    ) -> Result<(Arc<dyn Scanner>, Arc<dyn Reporter>, Arc<dyn CommandRunner>), StartError> {
        let scanner = match &self.scanner {
            Some(scanner) => Arc::clone(scanner),
            None => Arc::new(OsqueryScanner::new(
                config.scan_binary.clone(),
                config.scan_timeout,
            )),
        };
        let reporter = match &self.reporter {
            Some(reporter) => Arc::clone(reporter),
            None => Arc::new(HttpReporter::new(config.report_timeout)?),
        };
        let runner = match &self.runner {
            Some(runner) => Arc::clone(runner),
            None => Arc::new(ShellExecutor::new(config.shell.clone())),
        };
        Ok((scanner, reporter, runner))
    }
}

pub struct ControllerBuilder {
    source: ConfigSource,
    queue_capacity: usize,
    handle_signals: bool,
    collaborators: Collaborators,
}

impl ControllerBuilder {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Whether SIGINT/SIGTERM stop a running service (default: yes).
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.collaborators.scanner = Some(scanner);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.collaborators.reporter = Some(reporter);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.collaborators.runner = Some(runner);
        self
    }

    pub fn build(self) -> Arc<ServiceController> {
        let (state_tx, _) = watch::channel(ServiceState::Stopped);
        Arc::new(ServiceController {
            ctx: ServiceContext::new(self.queue_capacity),
            source: self.source,
            handle_signals: self.handle_signals,
            collaborators: self.collaborators,
            lifecycle: Mutex::new(Lifecycle::Stopped),
            generation: AtomicU64::new(0),
            state_tx,
        })
    }
}

struct RunningService {
    generation: u64,
    cancel: CancellationToken,
    addr: SocketAddr,
    grace: Duration,
    listener: JoinHandle<io::Result<()>>,
    worker: JoinHandle<()>,
    timer: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Running(RunningService),
}

pub struct ServiceController {
    ctx: Arc<ServiceContext>,
    source: ConfigSource,
    handle_signals: bool,
    collaborators: Collaborators,
    lifecycle: Mutex<Lifecycle>,
    generation: AtomicU64,
    state_tx: watch::Sender<ServiceState>,
}

impl ServiceController {
    pub fn builder(source: ConfigSource) -> ControllerBuilder {
        ControllerBuilder {
            source,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handle_signals: true,
            collaborators: Collaborators::default(),
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the service is (or becomes) stopped.
    pub async fn wait_until_stopped(&self) {
        let mut state = self.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state
            .wait_for(|state| *state == ServiceState::Stopped)
            .await;
    }

    /// Listener address of the current run.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(run) => Some(run.addr),
            Lifecycle::Stopped => None,
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), StartError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            self.ctx.log().info("Service is already running");
            return Ok(());
        }

        let config = self.source.load().map_err(|err| {
            self.ctx.log().error(format!("Error loading config: {}", err));
            StartError::from(err)
        })?;
        let (scanner, reporter, runner) = self.collaborators.resolve(&config).map_err(|err| {
            self.ctx.log().error(format!("Error starting service: {}", err));
            err
        })?;

        let addr = config.listen_addr();
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(err) => Err(err),
        };
        let (listener, local) = bound.map_err(|source| {
            self.ctx
                .log()
                .error(format!("Error starting server on {}: {}", addr, source));
            StartError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        self.ctx.status().set_all(LoopStatus::Running);

        let listener = http_server::serve(listener, Arc::clone(&self.ctx), cancel.clone());
        self.ctx
            .log()
            .info(format!("Server started on port {}", local.port()));
        info!(%local, generation, "Control API listening");

        let timer = ScanTimer::new(
            Arc::clone(&self.ctx),
            scanner,
            reporter,
            ScanSchedule {
                period: config.frequency,
                directory: config.directory.clone(),
                endpoint: config.endpoint.clone(),
            },
            cancel.clone(),
        )
        .spawn();

        let stop_request = StopRequest::new();
        let worker = CommandWorker::new(
            Arc::clone(&self.ctx),
            runner,
            stop_request.clone(),
            cancel.clone(),
        )
        .spawn();

        *lifecycle = Lifecycle::Running(RunningService {
            generation,
            cancel: cancel.clone(),
            addr: local,
            grace: config.shutdown_grace,
            listener,
            worker,
            timer,
        });
        self.state_tx.send_replace(ServiceState::Running);
        self.spawn_supervisor(generation, stop_request, cancel);
        drop(lifecycle);

        self.ctx.log().info("Service started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ShutdownError> {
        self.shutdown(None).await
    }

    /// Stops the current run; with `expected` set, only if it is that run.
    async fn shutdown(&self, expected: Option<u64>) -> Result<(), ShutdownError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let run = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(run) if expected.map_or(true, |id| id == run.generation) => run,
            other => {
                let stale = matches!(other, Lifecycle::Running(_));
                *lifecycle = other;
                if !stale {
                    self.ctx.log().info("No service running");
                }
                return Ok(());
            }
        };

        self.ctx.log().info("Stopping server...");
        run.cancel.cancel();

        let listener_result = join_listener(run.listener, run.grace).await;
        match &listener_result {
            Ok(()) => self.ctx.log().info("Server stopped"),
            Err(err) => self
                .ctx
                .log()
                .error(format!("Error shutting down server: {}", err)),
        }

        for (name, handle) in [("worker", run.worker), ("timer", run.timer)] {
            join_loop(name, handle, run.grace).await;
        }

        self.ctx.status().set_all(LoopStatus::Stopped);
        self.state_tx.send_replace(ServiceState::Stopped);
        drop(lifecycle);

        self.ctx.log().info("Service stopped");
        listener_result
    }

    /// Turns a `stop` directive or a termination signal into `stop()`.
    fn spawn_supervisor(
        self: &Arc<Self>,
        generation: u64,
        stop: StopRequest,
        cancel: CancellationToken,
    ) {
        let controller = Arc::clone(self);
        let handle_signals = self.handle_signals;
        tokio::spawn(async move {
            let reason = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = stop.requested() => "stop command",
                reason = shutdown_signal(), if handle_signals => reason,
            };
            if cancel.is_cancelled() {
                return;
            }

            info!(reason, generation, "Stop requested");
            controller.ctx.log().info("Shutting down service...");
            if let Err(err) = controller.shutdown(Some(generation)).await {
                warn!(%err, "Service stopped with errors");
            }
        });
    }
}

async fn join_listener(
    mut listener: JoinHandle<io::Result<()>>,
    grace: Duration,
) -> Result<(), ShutdownError> {
    match time::timeout(grace, &mut listener).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(ShutdownError::Listener(err)),
        Ok(Err(err)) => Err(ShutdownError::ListenerTask(fault_message(err))),
        Err(_) => {
            listener.abort();
            Err(ShutdownError::Deadline(grace))
        }
    }
}

async fn join_loop(name: &'static str, mut handle: JoinHandle<()>, grace: Duration) {
    match time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(task = name, fault = %fault_message(err), "Loop task failed"),
        Err(_) => {
            warn!(task = name, ?grace, "Loop did not stop in time; aborting");
            handle.abort();
        }
    }
}

/// Resolves on SIGINT or (on Unix) SIGTERM. Never resolves if neither
/// handler can be installed.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                warn!("Failed to install Ctrl+C handler: {}", err);
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        reason = ctrl_c => reason,
        reason = terminate => reason,
    }
}
