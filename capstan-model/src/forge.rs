//! The normalised pull-request record.
//!
//! Both forge paths (compound and fine-grained) are transformed into these
//! shapes before anything downstream sees them, so capture workers never
//! branch on which path served a read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Open => "open",
            PrState::Closed => "closed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Actor {
    pub github_id: i64,
    pub login: String,
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub github_id: i64,
    pub number: i32,
    pub title: String,
    pub body: Option<String>,
    pub state: PrState,
    pub draft: bool,
    pub additions: i64,
    pub deletions: i64,
    pub changed_files: i64,
    pub commit_count: i64,
    pub author: Option<Actor>,
    pub merged_by: Option<Actor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged: bool,
    pub mergeable: Option<bool>,
    pub base_ref: String,
    pub head_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrFile {
    pub filename: String,
    pub additions: i64,
    pub deletions: i64,
    pub changes: i64,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrReview {
    pub github_id: i64,
    pub state: String,
    pub body: Option<String>,
    pub author: Option<Actor>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub commit_id: Option<String>,
}

/// Issue comments and review comments share a shape; the review-thread
/// fields are populated only for the latter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrComment {
    pub github_id: i64,
    pub body: String,
    pub author: Option<Actor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub path: Option<String>,
    pub position: Option<i64>,
    pub original_position: Option<i64>,
    pub diff_hunk: Option<String>,
    pub in_reply_to_id: Option<i64>,
    pub review_id: Option<i64>,
}

impl PrComment {
    pub fn is_review_comment(&self) -> bool {
        self.path.is_some() || self.review_id.is_some()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommentSet {
    pub issue_comments: Vec<PrComment>,
    pub review_comments: Vec<PrComment>,
}

/// One logical read of everything about a pull request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequestData {
    pub pull_request: PullRequest,
    pub files: Vec<PrFile>,
    pub reviews: Vec<PrReview>,
    pub issue_comments: Vec<PrComment>,
    pub review_comments: Vec<PrComment>,
}

/// Budget attribution reported by the forge alongside a response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub cost: i64,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: Option<DateTime<Utc>>,
}
