//! At-least-once message queues
//!
//! A received message stays invisible for a visibility timeout. It is removed
//! only when acknowledged; a negative acknowledgement or an expired timeout
//! makes it deliverable again. Consumers must therefore tolerate duplicates.

mod memory;
mod spool;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue error types
#[derive(Error, Debug)]
pub enum QueueError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The receipt no longer identifies an in-flight message
    #[error("receipt expired or unknown: {0}")]
    ReceiptExpired(String),

    /// A spooled entry could not be interpreted
    #[error("invalid queue entry: {0}")]
    InvalidEntry(String),
}

/// One received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stable message identifier, identical across redeliveries
    pub message_id: String,
    /// Handle for ack/nack of this particular delivery
    pub receipt: String,
    /// Message body
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on each redelivery
    pub attempt: u32,
}

impl Delivery {
    /// Payload as text, lossy
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Message queue with at-least-once delivery
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Enqueue a message, returning its id
    async fn send(&self, payload: Vec<u8>) -> QueueResult<String>;

    /// Receive up to `max` visible messages, hiding them for `visibility`
    async fn receive(&self, max: usize, visibility: Duration) -> QueueResult<Vec<Delivery>>;

    /// Remove a delivered message for good
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Make a delivered message visible again immediately
    async fn nack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Messages not yet acknowledged, visible or in flight
    async fn pending(&self) -> QueueResult<usize>;
}
