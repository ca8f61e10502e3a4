//! In-process queue

use super::{Delivery, MessageQueue, QueueError, QueueResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Message {
    id: String,
    payload: Vec<u8>,
    attempts: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    inflight: HashMap<String, (Message, Instant)>,
}

impl State {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((message, _)) = self.inflight.remove(&receipt) {
                self.ready.push_back(message);
            }
        }
    }
}

/// Queue held in memory
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, payload: Vec<u8>) -> QueueResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.state.lock().ready.push_back(Message {
            id: id.clone(),
            payload,
            attempts: 0,
        });
        Ok(id)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> QueueResult<Vec<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.requeue_expired(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.attempts += 1;
            let receipt = uuid::Uuid::new_v4().to_string();
            deliveries.push(Delivery {
                message_id: message.id.clone(),
                receipt: receipt.clone(),
                payload: message.payload.clone(),
                attempt: message.attempts,
            });
            state.inflight.insert(receipt, (message, now + visibility));
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.state
            .lock()
            .inflight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::ReceiptExpired(delivery.receipt.clone()))
    }

    async fn nack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock();
        let (message, _) = state
            .inflight
            .remove(&delivery.receipt)
            .ok_or_else(|| QueueError::ReceiptExpired(delivery.receipt.clone()))?;
        state.ready.push_back(message);
        Ok(())
    }

    async fn pending(&self) -> QueueResult<usize> {
        let state = self.state.lock();
        Ok(state.ready.len() + state.inflight.len())
    }
}
