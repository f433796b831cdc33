//! Store capability traits. The Postgres implementations live beside them;
//! tests substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use capstan_model::{
    CaptureJob, CaptureProgress, JobId, PrComment, PrReview, PullRequest, RepositoryCategory,
    Result, RolloutConfig, RolloutHistoryEntry,
};

/// A repository row as the router and workers need it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoRef {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub category: Option<RepositoryCategory>,
}

impl RepoRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Aggregate job outcomes over a trailing window, for the health monitor.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct JobErrorStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    /// Jobs sitting in `processing` since before the window started.
    pub stale_processing: i64,
}

impl JobErrorStats {
    pub fn error_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &CaptureJob) -> Result<()>;
    async fn mark_processing(&self, id: JobId) -> Result<()>;
    async fn mark_completed(&self, id: JobId) -> Result<()>;
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<()>;
    async fn set_external_run_id(&self, id: JobId, run_id: &str) -> Result<()>;
    async fn fetch_job(&self, id: JobId) -> Result<Option<CaptureJob>>;
    async fn repository(&self, id: Uuid) -> Result<Option<RepoRef>>;
    async fn error_stats(&self, window: Duration) -> Result<JobErrorStats>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn upsert(&self, progress: &CaptureProgress) -> Result<()>;
    async fn fetch(&self, job_id: JobId) -> Result<Option<CaptureProgress>>;
}

#[async_trait]
pub trait RolloutStore: Send + Sync {
    async fn fetch_config(&self, feature: &str) -> Result<Option<RolloutConfig>>;
    /// Fetch the row, inserting the initial configuration if absent.
    async fn ensure_config(&self, feature: &str) -> Result<RolloutConfig>;
    /// Persist the new configuration and append its audit entry in one
    /// transaction; either both land or neither does.
    async fn apply(&self, config: &RolloutConfig, entry: &RolloutHistoryEntry) -> Result<()>;
    async fn history(&self, feature: &str, limit: i64) -> Result<Vec<RolloutHistoryEntry>>;
    async fn repository_category(
        &self,
        repository_id: Uuid,
    ) -> Result<Option<RepositoryCategory>>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Upsert keyed on `(repository_id, number)`; children are untouched.
    /// Returns the row id.
    async fn upsert_pull_request(&self, repository_id: Uuid, pr: &PullRequest) -> Result<Uuid>;
    /// Upsert keyed on `github_id`.
    async fn upsert_review(
        &self,
        repository_id: Uuid,
        pull_request_id: Uuid,
        review: &PrReview,
    ) -> Result<()>;
    /// Upsert keyed on `github_id`; issue vs review comment is derived
    /// from the record itself.
    async fn upsert_comment(
        &self,
        repository_id: Uuid,
        pull_request_id: Uuid,
        comment: &PrComment,
    ) -> Result<()>;
    async fn pull_request_id(&self, repository_id: Uuid, number: i32) -> Result<Option<Uuid>>;
    /// PR numbers updated since `since`, newest first.
    async fn recent_pr_numbers(
        &self,
        repository_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_handles_empty_window() {
        assert_eq!(JobErrorStats::default().error_rate(), 0.0);
        let stats = JobErrorStats {
            total: 10,
            completed: 8,
            failed: 2,
            stale_processing: 0,
        };
        assert!((stats.error_rate() - 0.2).abs() < 1e-9);
    }
}
