//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring ledger extension.
//!
//! # Metrics
//!
//! - `indexer_transactions_committed_total` - Transactions committed
//! - `indexer_batches_committed_total` - Batches committed
//! - `indexer_batch_size` - Histogram of transactions per batch
//! - `indexer_batch_duration_seconds` - Histogram of end-to-end batch latencies
//! - `indexer_top_of_ledger_state_version` - State version of the top of ledger

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Total transactions committed
    pub transactions_total: IntCounter,

    /// Total batches committed
    pub batches_total: IntCounter,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Batch duration histogram
    pub batch_duration: Histogram,

    /// Top of ledger
    pub top_of_ledger: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_total = IntCounter::new(
            "indexer_transactions_committed_total",
            "Total number of transactions committed",
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let batches_total = IntCounter::new(
            "indexer_batches_committed_total",
            "Total number of batches committed",
        )?;
        registry.register(Box::new(batches_total.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("indexer_batch_size", "Histogram of transactions per batch")
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let batch_duration = Histogram::with_opts(
            HistogramOpts::new("indexer_batch_duration_seconds", "Histogram of batch commit latencies")
                .buckets(vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0]),
        )?;
        registry.register(Box::new(batch_duration.clone()))?;

        let top_of_ledger = IntGauge::new(
            "indexer_top_of_ledger_state_version",
            "State version of the last committed transaction",
        )?;
        registry.register(Box::new(top_of_ledger.clone()))?;

        Ok(Self {
            transactions_total,
            batches_total,
            batch_size,
            batch_duration,
            top_of_ledger,
            registry,
        })
    }

    /// Record a committed batch
    pub fn record_batch_committed(&self, transactions: usize, duration_seconds: f64, state_version: u64) {
        self.transactions_total.inc_by(transactions as u64);
        self.batches_total.inc();
        self.batch_size.observe(transactions as f64);
        self.batch_duration.observe(duration_seconds);
        self.top_of_ledger.set(state_version as i64);
    }

    /// Set the top of ledger, e.g. on startup
    pub fn set_top_of_ledger(&self, state_version: u64) {
        self.top_of_ledger.set(state_version as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.transactions_total.get(), 0);
        assert_eq!(metrics.batches_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_batch_committed(3, 0.01, 3);
        assert_eq!(first.transactions_total.get(), 3);
        assert_eq!(second.transactions_total.get(), 0);
    }

    #[test]
    fn test_record_batch_committed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_batch_committed(10, 0.02, 10);
        metrics.record_batch_committed(5, 0.01, 15);

        assert_eq!(metrics.transactions_total.get(), 15);
        assert_eq!(metrics.batches_total.get(), 2);
        assert_eq!(metrics.batch_size.get_sample_count(), 2);
        assert_eq!(metrics.top_of_ledger.get(), 15);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "indexer_batch_duration_seconds"));
    }
}
