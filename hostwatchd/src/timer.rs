//! Periodic scan-and-report loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::{LoopStatus, ServiceContext};
use crate::outcome::{fault_message, Step};
use crate::report::{ReportError, ReportPayload, Reporter};
use crate::scan::{ScanError, Scanner};

pub const SYSTEM_STATS_PLACEHOLDER: &str = "System stats placeholder";

#[derive(Debug, Clone)]
pub struct ScanSchedule {
    pub period: Duration,
    pub directory: String,
    pub endpoint: String,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Debug, Error)]
enum TimerFault {
    #[error("scan cycle failed: {0}")]
    Cycle(#[from] CycleError),
    #[error("scan cycle panicked: {0}")]
    Panicked(String),
}

pub struct ScanTimer {
    ctx: Arc<ServiceContext>,
    scanner: Arc<dyn Scanner>,
    reporter: Arc<dyn Reporter>,
    schedule: ScanSchedule,
    cancel: CancellationToken,
}

impl ScanTimer {
    pub fn new(
        ctx: Arc<ServiceContext>,
        scanner: Arc<dyn Scanner>,
        reporter: Arc<dyn Reporter>,
        schedule: ScanSchedule,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            scanner,
            reporter,
            schedule,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// First cycle runs immediately, then once per period until cancelled.
    pub async fn run(self) {
        self.ctx.status().set_timer(LoopStatus::Running);

        while !self.cancel.is_cancelled() {
            match self.tick().await {
                Step::Continue => {}
                Step::Finished => break,
                Step::Recoverable(fault) => debug!(%fault, "Scan cycle incomplete"),
                Step::Fatal(fault) => {
                    self.ctx.log().error(format!("Timer terminated: {}", fault));
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.schedule.period) => {}
            }
        }

        self.ctx.status().set_timer(LoopStatus::Stopped);
        self.ctx.log().info("Timer stopped");
    }

    /// One cycle in its own task; cancellation aborts it mid-flight.
    async fn tick(&self) -> Step<TimerFault> {
        let ctx = Arc::clone(&self.ctx);
        let scanner = Arc::clone(&self.scanner);
        let reporter = Arc::clone(&self.reporter);
        let schedule = self.schedule.clone();
        let mut task =
            tokio::spawn(async move { run_cycle(&ctx, &*scanner, &*reporter, &schedule).await });

        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                task.abort();
                return Step::Finished;
            }
            joined = &mut task => joined,
        };

        match joined {
            Ok(Ok(())) => Step::Continue,
            Ok(Err(err)) => Step::Recoverable(TimerFault::Cycle(err)),
            Err(err) => Step::Fatal(TimerFault::Panicked(fault_message(err))),
        }
    }
}

/// Scan, journal the result, report it. Failures are journaled here.
pub async fn run_cycle(
    ctx: &ServiceContext,
    scanner: &dyn Scanner,
    reporter: &dyn Reporter,
    schedule: &ScanSchedule,
) -> Result<(), CycleError> {
    ctx.log().info("Checking for file modifications...");

    let files = match scanner.scan(&schedule.directory).await {
        Ok(files) => files,
        Err(err) => {
            ctx.log().error(format!("Error running scan: {}", err));
            return Err(err.into());
        }
    };
    ctx.log().info_json(&Value::from(files.clone()));

    let payload = ReportPayload::new(files, SYSTEM_STATS_PLACEHOLDER);
    match reporter.report(&schedule.endpoint, &payload).await {
        Ok(()) => {
            ctx.log().info("Data collected!");
            Ok(())
        }
        Err(err) => {
            ctx.log().error(format!("Error sending data to API: {}", err));
            Err(err.into())
        }
    }
}
