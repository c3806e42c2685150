//! Bounded FIFO of pending shell commands.
//!
//! Any number of producers (control API requests) push; exactly one worker
//! consumes. The receiver lives behind an async mutex so it survives service
//! restarts and a second consumer can never drain it concurrently.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("command queue is closed")]
    Closed,
    #[error("service is stopping")]
    Cancelled,
}

#[derive(Debug)]
pub struct CommandQueue {
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
    capacity: usize,
}

impl CommandQueue {
    /// Capacity is fixed here for the lifetime of the queue (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commands waiting to be consumed.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends to the tail, waiting for a free slot while the queue is full.
    ///
    /// Returns [`QueueError::Cancelled`] if `cancel` fires first; the command
    /// is then not queued.
    pub async fn push(
        &self,
        command: String,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            sent = self.sender.send(command) => sent.map_err(|_| QueueError::Closed),
        }
    }

    /// Takes the consumer side; waits while another consumer holds it.
    pub async fn consumer(&self) -> QueueConsumer {
        QueueConsumer {
            receiver: Arc::clone(&self.receiver).lock_owned().await,
        }
    }
}

/// Exclusive handle on the receiving end of a [`CommandQueue`].
#[derive(Debug)]
pub struct QueueConsumer {
    receiver: OwnedMutexGuard<mpsc::Receiver<String>>,
}

impl QueueConsumer {
    /// Next command in FIFO order; `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}
