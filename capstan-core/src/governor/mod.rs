//! Rate-limit governor: a per-process, advisory view of the forge's
//! cost budget. It records samples, predicts exhaustion and reports
//! efficiency; enforcement is the forge client's call.

mod report;

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use capstan_model::{GovernorThresholds, RateLimitSample};

pub use report::{
    Alert, AlertLevel, GovernorReport, QueryTypeEfficiency, Recommendation,
    RecommendationPriority, ReportSummary,
};

/// Samples older than this are evicted on every `track`.
const SAMPLE_WINDOW_HOURS: i64 = 24;
/// Most recent alerts retained.
const ALERT_CAP: usize = 50;
/// Reference window for `predict`.
const PREDICT_WINDOW: usize = 10;

#[derive(Debug, Default)]
struct GovernorState {
    samples: VecDeque<RateLimitSample>,
    alerts: VecDeque<Alert>,
}

/// Outcome of [`RateLimitGovernor::predict`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsagePrediction {
    pub average_cost: f64,
    pub predicted_cost: f64,
    pub current_remaining: i64,
    pub will_exceed_limit: bool,
    pub safe_queries: u64,
}

/// Shared through an `Arc`; writes take the interior lock, reads clone out.
/// `track` never suspends.
#[derive(Debug)]
pub struct RateLimitGovernor {
    state: Mutex<GovernorState>,
    thresholds: Mutex<GovernorThresholds>,
}

impl Default for RateLimitGovernor {
    fn default() -> Self {
        Self::new(GovernorThresholds::default())
    }
}

impl RateLimitGovernor {
    pub fn new(thresholds: GovernorThresholds) -> Self {
        Self {
            state: Mutex::new(GovernorState::default()),
            thresholds: Mutex::new(thresholds),
        }
    }

    pub fn set_thresholds(&self, thresholds: GovernorThresholds) {
        *self.thresholds.lock().expect("governor thresholds poisoned") = thresholds;
    }

    pub fn thresholds(&self) -> GovernorThresholds {
        *self.thresholds.lock().expect("governor thresholds poisoned")
    }

    /// Record one budget observation.
    pub fn track(&self, sample: RateLimitSample) {
        let thresholds = self.thresholds();
        let mut state = self.state.lock().expect("governor state poisoned");

        let horizon = Utc::now() - Duration::hours(SAMPLE_WINDOW_HOURS);
        while state
            .samples
            .front()
            .is_some_and(|s| s.recorded_at < horizon)
        {
            state.samples.pop_front();
        }

        if sample.remaining < thresholds.critical_remaining {
            push_alert(
                &mut state.alerts,
                Alert::new(
                    AlertLevel::Critical,
                    format!(
                        "budget critically low: {} of {} remaining",
                        sample.remaining, sample.limit
                    ),
                    Some(sample.query_type.clone()),
                ),
            );
        } else if sample.remaining < thresholds.warning_remaining {
            push_alert(
                &mut state.alerts,
                Alert::new(
                    AlertLevel::Warning,
                    format!(
                        "budget running low: {} of {} remaining",
                        sample.remaining, sample.limit
                    ),
                    Some(sample.query_type.clone()),
                ),
            );
        }

        if sample.items_processed > 0 {
            let points_per_item = sample.cost as f64 / sample.items_processed as f64;
            if points_per_item > thresholds.efficiency_points_per_item {
                push_alert(
                    &mut state.alerts,
                    Alert::new(
                        AlertLevel::Info,
                        format!(
                            "{} spent {points_per_item:.1} points per item",
                            sample.query_type
                        ),
                        Some(sample.query_type.clone()),
                    ),
                );
            }
        }

        state.samples.push_back(sample);
    }

    /// Remaining budget as of the newest sample, if any exists.
    pub fn latest_remaining(&self) -> Option<i64> {
        let state = self.state.lock().expect("governor state poisoned");
        state.samples.back().map(|s| s.remaining)
    }

    /// Reset time carried by the newest sample that reported one.
    pub fn latest_reset_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().expect("governor state poisoned");
        state.samples.iter().rev().find_map(|s| s.reset_at)
    }

    /// Project the cost of `queries_remaining` further calls from the mean
    /// cost of the last ten samples.
    pub fn predict(&self, queries_remaining: u64) -> UsagePrediction {
        let state = self.state.lock().expect("governor state poisoned");
        let window: Vec<&RateLimitSample> =
            state.samples.iter().rev().take(PREDICT_WINDOW).collect();
        let current_remaining = state.samples.back().map(|s| s.remaining).unwrap_or(0);

        if window.is_empty() {
            return UsagePrediction {
                average_cost: 0.0,
                predicted_cost: 0.0,
                current_remaining,
                will_exceed_limit: false,
                safe_queries: 0,
            };
        }

        let average_cost =
            window.iter().map(|s| s.cost as f64).sum::<f64>() / window.len() as f64;
        let predicted_cost = queries_remaining as f64 * average_cost;
        let safe_queries = if average_cost > 0.0 {
            (current_remaining.max(0) as f64 / average_cost).floor() as u64
        } else {
            u64::MAX
        };

        UsagePrediction {
            average_cost,
            predicted_cost,
            current_remaining,
            will_exceed_limit: predicted_cost > current_remaining as f64,
            safe_queries,
        }
    }

    /// Full snapshot: summary, per-query-type efficiency, retained alerts
    /// and the derived recommendations.
    pub fn generate_report(&self) -> GovernorReport {
        let state = self.state.lock().expect("governor state poisoned");
        report::build(&state.samples, &state.alerts)
    }
}

fn push_alert(alerts: &mut VecDeque<Alert>, alert: Alert) {
    alerts.push_back(alert);
    while alerts.len() > ALERT_CAP {
        alerts.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(remaining: i64, cost: i64) -> RateLimitSample {
        RateLimitSample::new(remaining, 5000, cost, "compound")
    }

    #[test]
    fn track_raises_warning_then_critical() {
        let governor = RateLimitGovernor::default();
        governor.track(sample(2000, 1));
        governor.track(sample(900, 1));
        governor.track(sample(50, 1));

        let report = governor.generate_report();
        let levels: Vec<AlertLevel> = report.alerts.iter().map(|a| a.level).collect();
        assert_eq!(levels, vec![AlertLevel::Warning, AlertLevel::Critical]);
    }

    #[test]
    fn inefficient_samples_raise_info_alerts() {
        let governor = RateLimitGovernor::default();
        governor.track(sample(4000, 30).with_items(2));
        let report = governor.generate_report();
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].level, AlertLevel::Info);
    }

    #[test]
    fn alerts_are_capped_at_fifty() {
        let governor = RateLimitGovernor::default();
        for _ in 0..80 {
            governor.track(sample(10, 1));
        }
        assert_eq!(governor.generate_report().alerts.len(), ALERT_CAP);
    }

    #[test]
    fn predict_uses_last_ten_samples() {
        let governor = RateLimitGovernor::default();
        // Twenty old samples at cost 100 that must fall out of the window.
        for _ in 0..20 {
            governor.track(sample(4000, 100));
        }
        for _ in 0..10 {
            governor.track(sample(4000, 2));
        }

        let prediction = governor.predict(100);
        assert_eq!(prediction.average_cost, 2.0);
        assert_eq!(prediction.predicted_cost, 200.0);
        assert_eq!(prediction.current_remaining, 4000);
        assert!(!prediction.will_exceed_limit);
        assert_eq!(prediction.safe_queries, 2000);
    }

    #[test]
    fn predict_flags_exhaustion() {
        let governor = RateLimitGovernor::default();
        governor.track(sample(100, 10));
        let prediction = governor.predict(50);
        assert!(prediction.will_exceed_limit);
        assert_eq!(prediction.safe_queries, 10);
    }

    #[test]
    fn predict_without_samples_is_inert() {
        let governor = RateLimitGovernor::default();
        let prediction = governor.predict(100);
        assert_eq!(prediction.average_cost, 0.0);
        assert!(!prediction.will_exceed_limit);
        assert_eq!(prediction.safe_queries, 0);
    }

    #[test]
    fn thresholds_are_mutable() {
        let governor = RateLimitGovernor::default();
        governor.set_thresholds(GovernorThresholds {
            warning_remaining: 10,
            critical_remaining: 2,
            efficiency_points_per_item: 100.0,
        });
        governor.track(sample(500, 1));
        assert!(governor.generate_report().alerts.is_empty());
    }
}
