use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cost an operation would pay on the fine-grained path: one point per
/// underlying call, five calls for a complete read.
pub const FINE_GRAINED_BASELINE: i64 = 5;

/// Per-process counters for the hybrid client. Aggregation across
/// processes belongs to the metrics collaborator, not here.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    compound_queries: AtomicU64,
    fine_grained_queries: AtomicU64,
    fallbacks: AtomicU64,
    total_points_saved: AtomicU64,
}

impl QueryMetrics {
    pub fn record_compound(&self) {
        self.compound_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Points saved by a fallback-free compound call, relative to the
    /// five-call baseline. Never negative, never decreasing.
    pub fn record_points_saved(&self, reported_cost: i64) {
        let saved = (FINE_GRAINED_BASELINE - reported_cost).max(0) as u64;
        self.total_points_saved.fetch_add(saved, Ordering::Relaxed);
    }

    pub fn record_fine_grained(&self, underlying_calls: u64) {
        self.fine_grained_queries
            .fetch_add(underlying_calls, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ForgeMetrics {
        let compound_queries = self.compound_queries.load(Ordering::Relaxed);
        let fine_grained_queries = self.fine_grained_queries.load(Ordering::Relaxed);
        let fallbacks = self.fallbacks.load(Ordering::Relaxed);
        let total_points_saved = self.total_points_saved.load(Ordering::Relaxed);

        let total_queries = compound_queries + fine_grained_queries;
        let fallback_rate = if compound_queries + fallbacks > 0 {
            fallbacks as f64 / (compound_queries + fallbacks) as f64
        } else {
            0.0
        };
        let efficiency = if total_queries > 0 {
            total_points_saved as f64 / total_queries as f64
        } else {
            0.0
        };

        ForgeMetrics {
            compound_queries,
            fine_grained_queries,
            fallbacks,
            total_points_saved,
            total_queries,
            fallback_rate,
            efficiency,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ForgeMetrics {
    pub compound_queries: u64,
    pub fine_grained_queries: u64,
    pub fallbacks: u64,
    pub total_points_saved: u64,
    pub total_queries: u64,
    pub fallback_rate: f64,
    pub efficiency: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_saved_never_goes_negative() {
        let metrics = QueryMetrics::default();
        metrics.record_points_saved(9);
        assert_eq!(metrics.snapshot().total_points_saved, 0);
        metrics.record_points_saved(1);
        assert_eq!(metrics.snapshot().total_points_saved, 4);
    }

    #[test]
    fn derived_rates() {
        let metrics = QueryMetrics::default();
        metrics.record_compound();
        metrics.record_compound();
        metrics.record_points_saved(1);
        metrics.record_points_saved(1);
        metrics.record_fallback();
        metrics.record_fine_grained(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 7);
        assert!((snapshot.fallback_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.efficiency - 8.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn empty_metrics_have_zero_rates() {
        let snapshot = QueryMetrics::default().snapshot();
        assert_eq!(snapshot.fallback_rate, 0.0);
        assert_eq!(snapshot.efficiency, 0.0);
    }
}
