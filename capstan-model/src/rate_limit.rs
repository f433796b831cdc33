use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One budget observation fed to the governor. Samples live in process
/// memory only and are evicted after 24 hours.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitSample {
    pub recorded_at: DateTime<Utc>,
    pub remaining: i64,
    pub limit: i64,
    pub cost: i64,
    pub query_type: String,
    pub items_processed: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSample {
    pub fn new(remaining: i64, limit: i64, cost: i64, query_type: impl Into<String>) -> Self {
        Self {
            recorded_at: Utc::now(),
            remaining,
            limit,
            cost,
            query_type: query_type.into(),
            items_processed: 0,
            reset_at: None,
        }
    }

    pub fn with_items(mut self, items_processed: u32) -> Self {
        self.items_processed = items_processed;
        self
    }

    pub fn with_reset_at(mut self, reset_at: Option<DateTime<Utc>>) -> Self {
        self.reset_at = reset_at;
        self
    }
}

/// Alerting thresholds for the governor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GovernorThresholds {
    /// Remaining budget below which a warning alert fires.
    pub warning_remaining: i64,
    /// Remaining budget below which a critical alert fires.
    pub critical_remaining: i64,
    /// Cost-per-item above which a query is flagged inefficient.
    pub efficiency_points_per_item: f64,
}

impl Default for GovernorThresholds {
    fn default() -> Self {
        Self {
            warning_remaining: 1000,
            critical_remaining: 100,
            efficiency_points_per_item: 5.0,
        }
    }
}
