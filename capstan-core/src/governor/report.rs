use std::collections::BTreeMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use capstan_model::RateLimitSample;

/// Remaining budget below which the report recommends throttling.
const THROTTLE_REMAINING: i64 = 500;
/// Mean points-per-item above which compound queries are recommended.
const COMPOUND_RECOMMENDATION_EFFICIENCY: f64 = 3.0;
/// Per-query-type mean cost above which the type is called out.
const HIGH_COST_PER_CALL: f64 = 10.0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub query_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, message: String, query_type: Option<String>) -> Self {
        Self {
            level,
            message,
            query_type,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: RecommendationPriority,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportSummary {
    pub current_remaining: i64,
    pub limit: i64,
    pub sample_count: usize,
    pub total_cost: i64,
    pub total_items: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryTypeEfficiency {
    pub query_type: String,
    pub calls: usize,
    pub average_cost: f64,
    pub points_per_item: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernorReport {
    pub summary: ReportSummary,
    pub efficiency: Vec<QueryTypeEfficiency>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Default)]
struct TypeAccumulator {
    calls: usize,
    cost: i64,
    items: u64,
}

pub(super) fn build(samples: &VecDeque<RateLimitSample>, alerts: &VecDeque<Alert>) -> GovernorReport {
    let latest = samples.back();
    let summary = ReportSummary {
        current_remaining: latest.map(|s| s.remaining).unwrap_or(0),
        limit: latest.map(|s| s.limit).unwrap_or(0),
        sample_count: samples.len(),
        total_cost: samples.iter().map(|s| s.cost).sum(),
        total_items: samples.iter().map(|s| s.items_processed as u64).sum(),
    };

    let mut by_type: BTreeMap<&str, TypeAccumulator> = BTreeMap::new();
    for sample in samples {
        let acc = by_type.entry(sample.query_type.as_str()).or_default();
        acc.calls += 1;
        acc.cost += sample.cost;
        acc.items += sample.items_processed as u64;
    }

    let efficiency: Vec<QueryTypeEfficiency> = by_type
        .iter()
        .map(|(query_type, acc)| QueryTypeEfficiency {
            query_type: query_type.to_string(),
            calls: acc.calls,
            average_cost: acc.cost as f64 / acc.calls as f64,
            points_per_item: (acc.items > 0).then(|| acc.cost as f64 / acc.items as f64),
        })
        .collect();

    let recommendations = recommend(&summary, &efficiency);

    GovernorReport {
        summary,
        efficiency,
        alerts: alerts.iter().cloned().collect(),
        recommendations,
    }
}

fn recommend(
    summary: &ReportSummary,
    efficiency: &[QueryTypeEfficiency],
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    if summary.total_items > 0 {
        let average_efficiency = summary.total_cost as f64 / summary.total_items as f64;
        if average_efficiency > COMPOUND_RECOMMENDATION_EFFICIENCY {
            recommendations.push(Recommendation {
                priority: RecommendationPriority::High,
                message: "prefer compound queries to reduce points".to_string(),
            });
        }
    }

    let expensive: Vec<&str> = efficiency
        .iter()
        .filter(|e| e.average_cost > HIGH_COST_PER_CALL)
        .map(|e| e.query_type.as_str())
        .collect();
    if !expensive.is_empty() {
        recommendations.push(Recommendation {
            priority: RecommendationPriority::Medium,
            message: format!("high-cost queries: {}", expensive.join(", ")),
        });
    }

    if summary.current_remaining < THROTTLE_REMAINING {
        recommendations.push(Recommendation {
            priority: RecommendationPriority::Critical,
            message: "throttle or switch to fine-grained path".to_string(),
        });
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(query_type: &str, remaining: i64, cost: i64, items: u32) -> RateLimitSample {
        RateLimitSample::new(remaining, 5000, cost, query_type).with_items(items)
    }

    #[test]
    fn report_groups_efficiency_by_query_type() {
        let mut samples = VecDeque::new();
        samples.push_back(tracked("compound", 4000, 2, 1));
        samples.push_back(tracked("compound", 3998, 4, 1));
        samples.push_back(tracked("rest:reviews", 3990, 1, 1));

        let report = build(&samples, &VecDeque::new());
        assert_eq!(report.summary.sample_count, 3);
        assert_eq!(report.summary.total_cost, 7);
        assert_eq!(report.efficiency.len(), 2);

        let compound = report
            .efficiency
            .iter()
            .find(|e| e.query_type == "compound")
            .unwrap();
        assert_eq!(compound.calls, 2);
        assert_eq!(compound.average_cost, 3.0);
    }

    #[test]
    fn expensive_per_item_usage_recommends_compound() {
        let mut samples = VecDeque::new();
        samples.push_back(tracked("rest:details", 4000, 20, 4));
        let report = build(&samples, &VecDeque::new());
        assert!(report.recommendations.iter().any(|r| {
            r.priority == RecommendationPriority::High && r.message.contains("compound")
        }));
    }

    #[test]
    fn high_cost_query_types_are_called_out() {
        let mut samples = VecDeque::new();
        samples.push_back(tracked("search", 4000, 40, 0));
        let report = build(&samples, &VecDeque::new());
        let medium = report
            .recommendations
            .iter()
            .find(|r| r.priority == RecommendationPriority::Medium)
            .unwrap();
        assert!(medium.message.contains("search"));
    }

    #[test]
    fn low_remaining_recommends_throttling() {
        let mut samples = VecDeque::new();
        samples.push_back(tracked("compound", 400, 1, 1));
        let report = build(&samples, &VecDeque::new());
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.priority == RecommendationPriority::Critical));
    }
}
