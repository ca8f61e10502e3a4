//! Graceful shutdown management for queue workers

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shutdown state shared by the workers of one process
#[derive(Debug, Default)]
pub struct ShutdownState {
    shutting_down: AtomicBool,
    inflight: AtomicUsize,
    shutdown_start: Mutex<Option<Instant>>,
    notify: Notify,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop intake; idempotent
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            *self.shutdown_start.lock() = Some(Instant::now());
            info!("Shutdown initiated");
        }
        self.notify.notify_waiters();
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has begun
    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutting_down() {
                return;
            }
            notified.await;
        }
    }

    /// Track a delivery being processed
    pub fn add_inflight(&self) {
        let count = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("In-flight deliveries: {}", count);
    }

    /// Stop tracking a delivery
    pub fn remove_inflight(&self) {
        let count = self.inflight.fetch_sub(1, Ordering::SeqCst);
        debug!("In-flight deliveries: {}", count.saturating_sub(1));
    }

    /// Deliveries currently being processed
    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Time since shutdown began
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.lock().map(|start| start.elapsed())
    }

    /// Wait for in-flight deliveries to finish
    ///
    /// Returns the number still in flight when the timeout expires.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<(), usize> {
        let deadline = Instant::now() + timeout;

        while self.inflight_count() > 0 {
            if Instant::now() > deadline {
                let count = self.inflight_count();
                warn!("Shutdown timeout with {} deliveries still in flight", count);
                return Err(count);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if let Some(elapsed) = self.shutdown_duration() {
            info!("Shutdown completed in {:?}", elapsed);
        }
        Ok(())
    }
}
