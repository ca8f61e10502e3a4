//! Queue workers
//!
//! A [`Worker`] polls a [`MessageQueue`] in batches and hands every delivery
//! to a [`MessageProcessor`], at most `concurrency` at a time. The outcome
//! decides what happens to the message:
//!
//! - success: acknowledged
//! - retryable failure: handed back for redelivery
//! - permanent failure, or too many deliveries: acknowledged and logged
//!
//! Each delivery is independent; one failing message never affects the
//! others in its batch.

mod metrics;
mod processors;
mod shutdown;

pub use metrics::{ProcessingStats, WorkerMetrics};
pub use processors::{ConsolidateProcessor, SummarizeProcessor, SummarizeOutcome, Summarizer};
pub use shutdown::ShutdownState;

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::queue::{Delivery, MessageQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Handles the deliveries of one queue
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// Process a single delivery
    async fn process(&self, delivery: &Delivery) -> Result<()>;

    /// Called when a delivery is successfully processed
    async fn on_success(&self, _delivery: &Delivery) {}

    /// Called when processing a delivery fails
    async fn on_failure(&self, _error: &PipelineError, _delivery: &Delivery) {}

    /// Check if redelivery could succeed
    fn is_retryable(&self, error: &PipelineError) -> bool {
        error.is_retryable()
    }

    /// Processor name for logs
    fn name(&self) -> &str;
}

/// Polls one queue and dispatches to one processor
pub struct Worker<P: MessageProcessor> {
    queue: Arc<dyn MessageQueue>,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: Arc<WorkerMetrics>,
    shutdown: Arc<ShutdownState>,
}

impl<P: MessageProcessor> Worker<P> {
    /// Create a worker with its own shutdown state
    pub fn new(queue: Arc<dyn MessageQueue>, processor: P, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            config,
            metrics: Arc::new(WorkerMetrics::new()),
            shutdown: Arc::new(ShutdownState::new()),
        }
    }

    /// Share a shutdown state with other workers
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownState>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Worker metrics
    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    /// Shutdown state in use
    pub fn shutdown_state(&self) -> Arc<ShutdownState> {
        self.shutdown.clone()
    }

    /// Processor in use
    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Receive one batch and process it to completion
    ///
    /// Returns the number of deliveries received.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self
            .queue
            .receive(self.config.batch_size, self.config.visibility_timeout())
            .await?;
        let received = batch.len();
        if received == 0 {
            return Ok(0);
        }
        debug!(processor = self.processor.name(), received, "Received batch");

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::with_capacity(received);
        for delivery in batch {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Config(format!("worker semaphore closed: {}", e)))?;
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let metrics = self.metrics.clone();
            let shutdown = self.shutdown.clone();
            let max_deliveries = self.config.max_deliveries;

            handles.push(tokio::spawn(async move {
                shutdown.add_inflight();
                handle_delivery(queue.as_ref(), processor.as_ref(), &metrics, max_deliveries, delivery).await;
                shutdown.remove_inflight();
                drop(permit);
            }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(processor = self.processor.name(), "Delivery task panicked: {}", e);
            }
        }
        Ok(received)
    }

    /// Process until no message is visible
    ///
    /// Returns the number of deliveries handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let handled = self.poll_once().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }

    /// Poll until shutdown begins, then wait for in-flight deliveries
    pub async fn run(&self) -> Result<()> {
        info!(processor = self.processor.name(), "Worker started");

        while !self.shutdown.is_shutting_down() {
            match self.poll_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = self.shutdown.wait_for_shutdown() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(processor = self.processor.name(), error = %e, "Polling failed");
                    tokio::select! {
                        _ = self.shutdown.wait_for_shutdown() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }

        if self.shutdown.wait_for_completion(self.config.shutdown_timeout()).await.is_err() {
            warn!(processor = self.processor.name(), "Stopped with deliveries still in flight");
        }
        let stats = self.metrics.processing_stats();
        info!(
            processor = self.processor.name(),
            processed = self.metrics.processed(),
            failed = self.metrics.failed(),
            dropped = self.metrics.dropped(),
            p50 = ?stats.p50,
            "Worker stopped"
        );
        Ok(())
    }
}

async fn handle_delivery<P: MessageProcessor>(
    queue: &dyn MessageQueue,
    processor: &P,
    metrics: &WorkerMetrics,
    max_deliveries: u32,
    delivery: Delivery,
) {
    metrics.increment_received();
    let name = processor.name();

    if delivery.attempt > max_deliveries {
        error!(
            processor = name,
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            payload = %delivery.payload_str(),
            "Delivery limit exceeded, dropping message"
        );
        metrics.increment_dropped();
        settle(queue, &delivery, true).await;
        return;
    }

    let start = Instant::now();
    let result = processor.process(&delivery).await;
    metrics.record_processing_duration(start.elapsed());

    match result {
        Ok(()) => {
            metrics.increment_processed();
            processor.on_success(&delivery).await;
            settle(queue, &delivery, true).await;
        }
        Err(e) => {
            metrics.increment_failed();
            metrics.record_error(e.kind());
            processor.on_failure(&e, &delivery).await;

            if processor.is_retryable(&e) {
                warn!(
                    processor = name,
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    error = %e,
                    "Processing failed, message will be redelivered"
                );
                metrics.increment_redelivered();
                settle(queue, &delivery, false).await;
            } else {
                error!(
                    processor = name,
                    message_id = %delivery.message_id,
                    error = %e,
                    payload = %delivery.payload_str(),
                    "Processing failed permanently, dropping message"
                );
                metrics.increment_dropped();
                settle(queue, &delivery, true).await;
            }
        }
    }
}

async fn settle(queue: &dyn MessageQueue, delivery: &Delivery, ack: bool) {
    let result = if ack {
        queue.ack(delivery).await
    } else {
        queue.nack(delivery).await
    };
    // An expired receipt means the message is visible again and will be redelivered
    if let Err(e) = result {
        warn!(message_id = %delivery.message_id, ack, error = %e, "Could not settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Fails payloads starting with "retry" until their third delivery
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl MessageProcessor for Recorder {
        async fn process(&self, delivery: &Delivery) -> Result<()> {
            let payload = delivery.payload_str().into_owned();
            self.seen.lock().push((payload.clone(), delivery.attempt));
            if payload.starts_with("bad") {
                return Err(PipelineError::Payload(payload));
            }
            if payload.starts_with("retry") && delivery.attempt < 3 {
                return Err(PipelineError::Conflict {
                    key: "t".to_string(),
                    attempts: 1,
                });
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            batch_size: 4,
            concurrency: 2,
            poll_interval_ms: 5,
            visibility_timeout_secs: 60,
            shutdown_timeout_secs: 1,
            max_deliveries: 5,
        }
    }

    #[tokio::test]
    async fn test_drain_acks_success_and_permanent_failure() {
        let queue = Arc::new(MemoryQueue::new());
        for payload in ["ok-1", "bad", "ok-2", "retry"] {
            queue.send(payload.as_bytes().to_vec()).await.unwrap();
        }

        let worker = Worker::new(queue.clone(), Recorder::default(), config());
        worker.drain().await.unwrap();

        assert_eq!(queue.pending().await.unwrap(), 0);
        let metrics = worker.metrics();
        assert_eq!(metrics.processed(), 3);
        assert_eq!(metrics.dropped(), 1);
        assert_eq!(metrics.redelivered(), 2);
        assert_eq!(metrics.error_count("payload"), 1);

        let seen = worker.processor().seen.lock().clone();
        let retry_attempts: Vec<u32> = seen.iter().filter(|(p, _)| p == "retry").map(|(_, a)| *a).collect();
        assert_eq!(retry_attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_delivery_limit_drops_message() {
        let queue = Arc::new(MemoryQueue::new());
        queue.send(b"retry-forever".to_vec()).await.unwrap();

        let worker = Worker::new(
            queue.clone(),
            Recorder::default(),
            WorkerConfig {
                max_deliveries: 2,
                ..config()
            },
        );
        worker.drain().await.unwrap();

        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(worker.metrics().dropped(), 1);
        assert_eq!(worker.processor().seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new());
        queue.send(b"ok".to_vec()).await.unwrap();

        let worker = Arc::new(Worker::new(queue.clone(), Recorder::default(), config()));
        let shutdown = worker.shutdown_state();
        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(worker.metrics().processed(), 1);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
