//! hostwatch agent.
//!
//! Periodically enumerates a watched directory and reports the listing to a
//! collector, while a serial worker runs shell commands submitted through a
//! small local HTTP control API. [`ServiceController`] ties the pieces
//! together and owns their lifecycle.

pub mod config;
pub mod context;
pub mod controller;
pub mod http_server;
pub mod journal;
pub mod outcome;
pub mod queue;
pub mod report;
pub mod scan;
pub mod timer;
pub mod worker;

pub use config::{AgentConfig, ConfigError, ConfigSource};
pub use context::{HealthReport, LoopStatus, ServiceContext};
pub use controller::{
    ControllerBuilder, ServiceController, ServiceState, ShutdownError, StartError,
    DEFAULT_QUEUE_CAPACITY,
};
pub use journal::{LogEntry, LogEvent, LogSink};
pub use queue::{CommandQueue, QueueError};
pub use report::{HttpReporter, ReportError, ReportPayload, Reporter};
pub use scan::{OsqueryScanner, ScanError, Scanner};
pub use worker::{CommandError, CommandRunner, Directive, ShellExecutor};
