//! State shared by the tasks of one service.
//!
//! The controller creates a single [`ServiceContext`] and hands clones of the
//! `Arc` to the worker, the timer and the control API. Nothing here is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::journal::LogSink;
use crate::queue::{CommandQueue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Running,
    Stopped,
}

impl LoopStatus {
    fn from_flag(running: bool) -> Self {
        if running {
            LoopStatus::Running
        } else {
            LoopStatus::Stopped
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(rename = "workerThread")]
    pub worker: LoopStatus,
    #[serde(rename = "timerThread")]
    pub timer: LoopStatus,
}

/// Last status each loop (or the controller) published.
#[derive(Debug, Default)]
pub struct StatusBoard {
    worker: AtomicBool,
    timer: AtomicBool,
}

impl StatusBoard {
    pub fn set_worker(&self, status: LoopStatus) {
        self.worker.store(status == LoopStatus::Running, Ordering::SeqCst);
    }

    pub fn set_timer(&self, status: LoopStatus) {
        self.timer.store(status == LoopStatus::Running, Ordering::SeqCst);
    }

    pub fn set_all(&self, status: LoopStatus) {
        self.set_worker(status);
        self.set_timer(status);
    }

    pub fn worker(&self) -> LoopStatus {
        LoopStatus::from_flag(self.worker.load(Ordering::SeqCst))
    }

    pub fn timer(&self) -> LoopStatus {
        LoopStatus::from_flag(self.timer.load(Ordering::SeqCst))
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            worker: self.worker(),
            timer: self.timer(),
        }
    }
}

#[derive(Debug)]
pub struct ServiceContext {
    log: LogSink,
    queue: CommandQueue,
    status: StatusBoard,
}

impl ServiceContext {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            log: LogSink::new(),
            queue: CommandQueue::new(queue_capacity),
            status: StatusBoard::default(),
        })
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Queues a command for the worker, journaling before and after.
    pub async fn enqueue_command(
        &self,
        command: String,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.log.info(format!("Adding command to queue: {}", command));
        match self.queue.push(command.clone(), cancel).await {
            Ok(()) => {
                self.log.info(format!("Command queued: {}", command));
                Ok(())
            }
            Err(err) => {
                self.log.warn(format!("Command not queued ({}): {}", err, command));
                Err(err)
            }
        }
    }
}
