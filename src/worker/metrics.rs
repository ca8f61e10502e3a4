//! Worker metrics collection

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Samples kept for latency statistics
const MAX_SAMPLES: usize = 1000;

/// Latency statistics over recent deliveries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    /// Number of samples
    pub count: usize,
    /// Median
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// Mean
    pub mean: Duration,
}

/// Counters of one worker
#[derive(Debug)]
pub struct WorkerMetrics {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    redelivered: AtomicU64,
    processing_durations: RwLock<Vec<Duration>>,
    error_counts: RwLock<HashMap<&'static str, u64>>,
    start_time: Instant,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            processing_durations: RwLock::new(Vec::new()),
            error_counts: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a received delivery
    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully processed delivery
    pub fn increment_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed attempt
    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message given up on
    pub fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery handed back for redelivery
    pub fn increment_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error by kind
    pub fn record_error(&self, kind: &'static str) {
        *self.error_counts.write().entry(kind).or_insert(0) += 1;
    }

    /// Record processing duration
    pub fn record_processing_duration(&self, duration: Duration) {
        let mut durations = self.processing_durations.write();
        durations.push(duration);
        if durations.len() > MAX_SAMPLES {
            durations.remove(0);
        }
    }

    /// Deliveries received
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Deliveries processed successfully
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Failed attempts
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Messages dropped without success
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliveries handed back to the queue
    pub fn redelivered(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }

    /// Errors seen of one kind
    pub fn error_count(&self, kind: &str) -> u64 {
        self.error_counts.read().get(kind).copied().unwrap_or(0)
    }

    /// Latency statistics
    pub fn processing_stats(&self) -> ProcessingStats {
        let durations = self.processing_durations.read();
        if durations.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted = durations.clone();
        sorted.sort();
        let p95_idx = ((sorted.len() - 1) as f64 * 0.95) as usize;
        let total: Duration = sorted.iter().sum();

        ProcessingStats {
            count: sorted.len(),
            p50: sorted[sorted.len() / 2],
            p95: sorted[p95_idx],
            mean: total / sorted.len() as u32,
        }
    }

    /// Deliveries received per second since start
    pub fn deliveries_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.received() as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = WorkerMetrics::new();
        metrics.increment_received();
        metrics.increment_received();
        metrics.increment_processed();
        metrics.increment_failed();
        metrics.record_error("conflict");
        metrics.record_error("conflict");

        assert_eq!(metrics.received(), 2);
        assert_eq!(metrics.processed(), 1);
        assert_eq!(metrics.failed(), 1);
        assert_eq!(metrics.error_count("conflict"), 2);
        assert_eq!(metrics.error_count("parse"), 0);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = WorkerMetrics::new();
        assert_eq!(metrics.processing_stats().count, 0);

        for ms in 1..=100 {
            metrics.record_processing_duration(Duration::from_millis(ms));
        }
        let stats = metrics.processing_stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.p50, Duration::from_millis(51));
        assert_eq!(stats.p95, Duration::from_millis(95));
        assert_eq!(stats.mean, Duration::from_micros(50_500));
    }
}
