//! Serial command worker.
//!
//! Drains the [`CommandQueue`](crate::queue::CommandQueue) one command at a
//! time. Control directives are handled in-process; everything else is handed
//! to a [`CommandRunner`] (a subordinate shell by default).

use std::io::{self, Read};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use strip_ansi_escapes::strip;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{LoopStatus, ServiceContext};
use crate::outcome::{fault_message, Step};

pub const DEFAULT_SHELL: &str = "bash";
const LOG_SNIPPET_LIMIT: usize = 2048;

/// How the worker interprets one queued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `logs`: ask journal subscribers to refresh.
    Logs,
    /// `stop`: ask the controller to stop the service.
    Stop,
    Shell(String),
}

impl Directive {
    pub fn classify(command: &str) -> Self {
        match command.trim().to_ascii_lowercase().as_str() {
            "logs" => Directive::Logs,
            "stop" => Directive::Stop,
            _ => Directive::Shell(command.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{shell}`: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to collect output: {0}")]
    Output(#[source] io::Error),
    #[error("exit status {code}")]
    Exit { code: i32, output: String },
    #[error("terminated by signal")]
    Signaled { output: String },
}

impl CommandError {
    /// Captured stdout/stderr, empty if the process never ran.
    pub fn output(&self) -> &str {
        match self {
            CommandError::Spawn { .. } | CommandError::Output(_) => "",
            CommandError::Exit { output, .. } | CommandError::Signaled { output } => output,
        }
    }
}

/// Executes a shell command line and returns its combined output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<String, CommandError>;
}

/// Runs commands as `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

#[async_trait]
impl CommandRunner for ShellExecutor {
    async fn run(&self, command: &str) -> Result<String, CommandError> {
        let spawn_error = |source| CommandError::Spawn {
            shell: self.shell.clone(),
            source,
        };

        // stdout and stderr share one pipe so the output keeps write order.
        let (mut reader, writer) = io::pipe().map_err(spawn_error)?;
        let stderr = writer.try_clone().map_err(spawn_error)?;
        let mut child = {
            let mut shell = TokioCommand::new(&self.shell);
            shell
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr)
                .kill_on_drop(true);
            shell.spawn().map_err(spawn_error)?
        };

        let collect = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).map(|_| buf)
        });
        let status = child.wait().await.map_err(CommandError::Output)?;
        let bytes = collect
            .await
            .map_err(|err| CommandError::Output(io::Error::other(err)))?
            .map_err(CommandError::Output)?;

        let combined = decode_and_strip(&bytes);
        debug!(
            command,
            code = ?status.code(),
            output = %summarize_for_log(&combined),
            "Shell command finished"
        );

        if status.success() {
            Ok(combined)
        } else if let Some(code) = status.code() {
            Err(CommandError::Exit {
                code,
                output: combined,
            })
        } else {
            Err(CommandError::Signaled { output: combined })
        }
    }
}

/// One-shot request, shared between the worker and the controller's
/// supervisor, asking for the service to stop.
#[derive(Debug, Clone, Default)]
pub struct StopRequest(CancellationToken);

impl StopRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.cancel();
    }

    pub async fn requested(&self) {
        self.0.cancelled().await
    }
}

#[derive(Debug, Error)]
enum WorkerFault {
    #[error("command queue closed")]
    QueueClosed,
    #[error("command task failed: {0}")]
    Task(String),
}

pub struct CommandWorker {
    ctx: Arc<ServiceContext>,
    runner: Arc<dyn CommandRunner>,
    stop: StopRequest,
    cancel: CancellationToken,
}

impl CommandWorker {
    pub fn new(
        ctx: Arc<ServiceContext>,
        runner: Arc<dyn CommandRunner>,
        stop: StopRequest,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            runner,
            stop,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        self.ctx.status().set_worker(LoopStatus::Running);

        let consumer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            consumer = self.ctx.queue().consumer() => Some(consumer),
        };

        if let Some(mut consumer) = consumer {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    next = consumer.recv() => next,
                };

                match self.process(next).await {
                    Step::Continue => {}
                    Step::Finished => break,
                    Step::Recoverable(fault) => {
                        self.ctx
                            .log()
                            .error(format!("Recovered from fault in worker: {}", fault));
                    }
                    Step::Fatal(fault) => {
                        self.ctx.log().error(format!("Worker terminated: {}", fault));
                        break;
                    }
                }
            }
        }

        self.ctx.status().set_worker(LoopStatus::Stopped);
        self.ctx.log().info("Worker stopped");
    }

    async fn process(&self, next: Option<String>) -> Step<WorkerFault> {
        let Some(command) = next else {
            return Step::Fatal(WorkerFault::QueueClosed);
        };

        self.ctx.log().info(format!("Executing command: {}", command));

        match Directive::classify(&command) {
            Directive::Logs => {
                self.ctx.log().request_refresh();
                Step::Continue
            }
            Directive::Stop => {
                // Later commands stay queued for the next run.
                self.stop.request();
                Step::Finished
            }
            Directive::Shell(command) => self.execute(command).await,
        }
    }

    /// Runs one shell command in its own task so a panic stays contained.
    async fn execute(&self, command: String) -> Step<WorkerFault> {
        let ctx = Arc::clone(&self.ctx);
        let runner = Arc::clone(&self.runner);
        let label = command.clone();
        let mut task = tokio::spawn(async move {
            match runner.run(&command).await {
                Ok(output) => ctx.log().info(format!(
                    "Command executed successfully: {} | Output: {}",
                    command, output
                )),
                Err(err) => ctx.log().error(format!(
                    "Error executing command: {} | Output: {}",
                    err,
                    err.output()
                )),
            }
        });

        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                task.abort();
                warn!(command = %label, "Command aborted by shutdown");
                self.ctx
                    .log()
                    .warn(format!("Command aborted by shutdown: {}", label));
                return Step::Finished;
            }
            joined = &mut task => joined,
        };

        match joined {
            Ok(()) => Step::Continue,
            Err(err) => Step::Recoverable(WorkerFault::Task(fault_message(err))),
        }
    }
}

fn decode_and_strip(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    let decode = |data: &[u8]| String::from_utf8_lossy(data).to_string();

    if !bytes.contains(&b'\x1b') {
        return decode(bytes);
    }

    match strip(bytes) {
        Ok(clean) => decode(&clean),
        Err(err) => {
            warn!(?err, "Failed to strip ANSI escapes from command output");
            decode(bytes)
        }
    }
}

fn summarize_for_log(payload: &str) -> String {
    if payload.len() <= LOG_SNIPPET_LIMIT {
        payload.to_string()
    } else {
        format!(
            "{}… (truncated {} chars)",
            truncate(payload, LOG_SNIPPET_LIMIT),
            payload.len() - LOG_SNIPPET_LIMIT
        )
    }
}

fn truncate(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}
