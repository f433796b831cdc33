use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CaptureError;

/// The feature every shipped surface defaults to.
pub const DEFAULT_FEATURE: &str = "hybrid_progressive_capture";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    Percentage,
    Whitelist,
    RepositorySize,
}

impl RolloutStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStrategy::Percentage => "percentage",
            RolloutStrategy::Whitelist => "whitelist",
            RolloutStrategy::RepositorySize => "repository_size",
        }
    }
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutStrategy {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(RolloutStrategy::Percentage),
            "whitelist" => Ok(RolloutStrategy::Whitelist),
            "repository_size" => Ok(RolloutStrategy::RepositorySize),
            other => Err(CaptureError::InvalidArgument(format!(
                "unknown rollout strategy: {other}"
            ))),
        }
    }
}

/// What a history entry records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutAction {
    Updated,
    Rollback,
    Stop,
    Resume,
}

impl RolloutAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutAction::Updated => "updated",
            RolloutAction::Rollback => "rollback",
            RolloutAction::Stop => "stop",
            RolloutAction::Resume => "resume",
        }
    }
}

impl FromStr for RolloutAction {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updated" => Ok(RolloutAction::Updated),
            "rollback" => Ok(RolloutAction::Rollback),
            "stop" => Ok(RolloutAction::Stop),
            "resume" => Ok(RolloutAction::Resume),
            other => Err(CaptureError::InvalidArgument(format!(
                "unknown rollout action: {other}"
            ))),
        }
    }
}

/// Size buckets used by the `repository_size` strategy. Stages open in
/// declaration order as the configured percentage crosses each threshold.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryCategory {
    Test,
    Small,
    Medium,
    Large,
}

impl RepositoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryCategory::Test => "test",
            RepositoryCategory::Small => "small",
            RepositoryCategory::Medium => "medium",
            RepositoryCategory::Large => "large",
        }
    }

    /// Percentage at which this category opens.
    pub fn open_threshold(&self) -> u8 {
        match self {
            RepositoryCategory::Test => 25,
            RepositoryCategory::Small => 50,
            RepositoryCategory::Medium => 75,
            RepositoryCategory::Large => 100,
        }
    }

    pub fn is_open_at(&self, percentage: u8) -> bool {
        percentage >= self.open_threshold()
    }
}

impl FromStr for RepositoryCategory {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(RepositoryCategory::Test),
            "small" => Ok(RepositoryCategory::Small),
            "medium" => Ok(RepositoryCategory::Medium),
            "large" => Ok(RepositoryCategory::Large),
            other => Err(CaptureError::InvalidArgument(format!(
                "unknown repository category: {other}"
            ))),
        }
    }
}

/// Row in `rollout_configuration`, one per feature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub feature: String,
    pub percentage: u8,
    pub strategy: RolloutStrategy,
    /// Repository ids admitted by the `whitelist` strategy.
    #[serde(default)]
    pub whitelist: Vec<Uuid>,
    pub emergency_stop: bool,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl RolloutConfig {
    pub fn initial(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            percentage: 0,
            strategy: RolloutStrategy::Percentage,
            whitelist: Vec::new(),
            emergency_stop: false,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    /// The stored percentage unless the feature is emergency-stopped, in
    /// which case the effective value is 0.
    pub fn effective_percentage(&self) -> u8 {
        if self.emergency_stop { 0 } else { self.percentage }
    }
}

/// Row in the append-only `rollout_history` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RolloutHistoryEntry {
    pub id: Uuid,
    pub feature: String,
    pub action: RolloutAction,
    pub previous_percentage: u8,
    pub new_percentage: u8,
    pub reason: String,
    pub triggered_by: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl RolloutHistoryEntry {
    pub fn record(
        feature: &str,
        action: RolloutAction,
        previous_percentage: u8,
        new_percentage: u8,
        reason: impl Into<String>,
        triggered_by: impl Into<String>,
    ) -> Self {
        let triggered_by = triggered_by.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            feature: feature.to_string(),
            action,
            previous_percentage,
            new_percentage,
            reason: reason.into(),
            triggered_by: triggered_by.clone(),
            metadata: serde_json::json!({
                "timestamp": now,
                "caller": triggered_by,
            }),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_stop_zeroes_effective_percentage() {
        let mut config = RolloutConfig::initial(DEFAULT_FEATURE);
        config.percentage = 50;
        assert_eq!(config.effective_percentage(), 50);
        config.emergency_stop = true;
        assert_eq!(config.effective_percentage(), 0);
    }

    #[test]
    fn categories_open_in_stage_order() {
        assert!(!RepositoryCategory::Test.is_open_at(24));
        assert!(RepositoryCategory::Test.is_open_at(25));
        assert!(!RepositoryCategory::Small.is_open_at(49));
        assert!(RepositoryCategory::Small.is_open_at(50));
        assert!(RepositoryCategory::Medium.is_open_at(75));
        assert!(!RepositoryCategory::Large.is_open_at(99));
        assert!(RepositoryCategory::Large.is_open_at(100));
    }
}
