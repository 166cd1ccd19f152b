//! Bounded internal queue between the adapters and the dispatch loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::BridgeError;
use crate::message::InternalMessage;

/// Default capacity of the internal queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Producer side, shared by the mesh bridge and the local channel.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<InternalMessage>,
}

/// Consumer side, owned by the dispatch loop.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<InternalMessage>,
}

/// Create a FIFO queue holding at most `capacity` messages.
pub fn message_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

impl QueueSender {
    /// Enqueue without waiting. A full queue fails with
    /// [`BridgeError::QueueFull`].
    pub fn push(&self, message: InternalMessage) -> Result<(), BridgeError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => BridgeError::QueueFull,
            TrySendError::Closed(_) => BridgeError::QueueClosed,
        })
    }
}

impl QueueReceiver {
    /// Dequeue the oldest message, waiting at most `wait`. Returns `None`
    /// when nothing arrived in time.
    pub async fn pop(&mut self, wait: Duration) -> Result<Option<InternalMessage>, BridgeError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(BridgeError::QueueClosed),
            Err(_) => Ok(None),
        }
    }

    /// Number of messages waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
