use async_trait::async_trait;
use chrono::{DateTime, Utc};

use capstan_model::{CommentSet, PrReview, PullRequest, PullRequestData, RateLimitInfo, Result};

/// The capability every capture worker consumes. Implementations must
/// return the normalised record regardless of how they read the forge.
#[async_trait]
pub trait ForgeReader: Send + Sync {
    /// Everything about one pull request in a single logical read.
    async fn pr_complete_data(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<PullRequestData>;

    async fn pr_reviews(&self, owner: &str, repo: &str, number: i32) -> Result<Vec<PrReview>>;

    async fn pr_comments(&self, owner: &str, repo: &str, number: i32) -> Result<CommentSet>;

    /// Pull requests updated since `since`, newest first, at most `limit`.
    async fn recent_prs(
        &self,
        owner: &str,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullRequest>>;
}

/// The compound path. Identical shape to [`ForgeReader`] except every read
/// also surfaces the budget attribution the forge reported for it, which
/// the hybrid client feeds into the points-saved accounting.
#[async_trait]
pub trait CompoundReader: Send + Sync {
    async fn pr_complete_data(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<(PullRequestData, RateLimitInfo)>;

    async fn pr_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<(Vec<PrReview>, RateLimitInfo)>;

    async fn pr_comments(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<(CommentSet, RateLimitInfo)>;

    async fn recent_prs(
        &self,
        owner: &str,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<(Vec<PullRequest>, RateLimitInfo)>;
}
