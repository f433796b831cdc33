//! Compound forge path: one structured query per logical read. The forge
//! attributes an authoritative cost to every response, which flows into
//! the governor and the points-saved accounting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use capstan_model::{
    Actor, CaptureError, CommentSet, PrComment, PrFile, PrReview, PrState, PullRequest,
    PullRequestData, RateLimitInfo, RateLimitSample, Result,
};

use crate::governor::RateLimitGovernor;

use super::transport;

pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

const COMPLETE_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      databaseId number title body state isDraft
      additions deletions changedFiles
      commits { totalCount }
      author { login avatarUrl ... on User { databaseId } }
      mergedBy { login avatarUrl ... on User { databaseId } }
      createdAt updatedAt closedAt mergedAt merged mergeable
      baseRefName headRefName
      files(first: 100) { nodes { path additions deletions changeType } }
      reviews(first: 100) {
        nodes {
          databaseId state body submittedAt
          author { login avatarUrl ... on User { databaseId } }
          commit { oid }
        }
      }
      comments(first: 100) {
        nodes {
          databaseId body createdAt updatedAt
          author { login avatarUrl ... on User { databaseId } }
        }
      }
      reviewThreads(first: 50) {
        nodes {
          comments(first: 50) {
            nodes {
              databaseId body createdAt updatedAt path position originalPosition diffHunk
              author { login avatarUrl ... on User { databaseId } }
              replyTo { databaseId }
              pullRequestReview { databaseId }
            }
          }
        }
      }
    }
  }
  rateLimit { cost remaining limit resetAt }
}
"#;

const REVIEWS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      reviews(first: 100) {
        nodes {
          databaseId state body submittedAt
          author { login avatarUrl ... on User { databaseId } }
          commit { oid }
        }
      }
    }
  }
  rateLimit { cost remaining limit resetAt }
}
"#;

const COMMENTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      comments(first: 100) {
        nodes {
          databaseId body createdAt updatedAt
          author { login avatarUrl ... on User { databaseId } }
        }
      }
      reviewThreads(first: 50) {
        nodes {
          comments(first: 50) {
            nodes {
              databaseId body createdAt updatedAt path position originalPosition diffHunk
              author { login avatarUrl ... on User { databaseId } }
              replyTo { databaseId }
              pullRequestReview { databaseId }
            }
          }
        }
      }
    }
  }
  rateLimit { cost remaining limit resetAt }
}
"#;

const RECENT_QUERY: &str = r#"
query($owner: String!, $name: String!, $limit: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: $limit, states: [OPEN, CLOSED, MERGED],
                 orderBy: { field: UPDATED_AT, direction: DESC }) {
      nodes {
        databaseId number title body state isDraft
        additions deletions changedFiles
        commits { totalCount }
        author { login avatarUrl ... on User { databaseId } }
        mergedBy { login avatarUrl ... on User { databaseId } }
        createdAt updatedAt closedAt mergedAt merged mergeable
        baseRefName headRefName
      }
    }
  }
  rateLimit { cost remaining limit resetAt }
}
"#;

pub struct CompoundClient {
    client: Arc<Client>,
    graphql_url: String,
    token: String,
    governor: Arc<RateLimitGovernor>,
}

impl CompoundClient {
    pub fn new(
        client: Arc<Client>,
        graphql_url: impl Into<String>,
        token: impl Into<String>,
        governor: Arc<RateLimitGovernor>,
    ) -> Self {
        Self {
            client,
            graphql_url: graphql_url.into(),
            token: token.into(),
            governor,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let response = self
            .client
            .post(&self.graphql_url)
            .bearer_auth(&self.token)
            .header("user-agent", "capstan")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(CaptureError::Transport(format!(
                "compound endpoint returned status {}",
                response.status()
            )));
        }

        let envelope: Envelope<T> = response.json().await.map_err(transport)?;
        if let Some(errors) = envelope.errors
            && !errors.is_empty()
        {
            if errors.iter().any(|e| e.kind.as_deref() == Some("NOT_FOUND")) {
                return Err(CaptureError::NotFound(errors[0].message.clone()));
            }
            return Err(CaptureError::Transport(format!(
                "compound query failed: {}",
                errors[0].message
            )));
        }

        envelope
            .data
            .ok_or_else(|| CaptureError::Transport("compound response had no data".to_string()))
    }

    fn track(&self, query_type: &str, info: RateLimitInfo, items: u32) {
        self.governor.track(
            RateLimitSample::new(info.remaining, info.limit, info.cost, query_type)
                .with_items(items)
                .with_reset_at(info.reset_at),
        );
    }
}

#[async_trait]
impl super::traits::CompoundReader for CompoundClient {
    async fn pr_complete_data(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<(PullRequestData, RateLimitInfo)> {
        let data: PrData = self
            .execute(
                COMPLETE_QUERY,
                json!({ "owner": owner, "name": repo, "number": number }),
            )
            .await?;
        let info = data.rate_limit.normalise();
        let pull = data
            .repository
            .and_then(|r| r.pull_request)
            .ok_or_else(|| CaptureError::NotFound(format!("{owner}/{repo}#{number}")))?;

        let record = pull.into_complete();
        self.track("compound:complete", info, 1);
        Ok((record, info))
    }

    async fn pr_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<(Vec<PrReview>, RateLimitInfo)> {
        let data: PrData = self
            .execute(
                REVIEWS_QUERY,
                json!({ "owner": owner, "name": repo, "number": number }),
            )
            .await?;
        let info = data.rate_limit.normalise();
        let pull = data
            .repository
            .and_then(|r| r.pull_request)
            .ok_or_else(|| CaptureError::NotFound(format!("{owner}/{repo}#{number}")))?;

        let reviews: Vec<PrReview> = pull
            .reviews
            .map(|r| r.nodes.into_iter().map(GqlReview::normalise).collect())
            .unwrap_or_default();
        self.track("compound:reviews", info, reviews.len() as u32);
        Ok((reviews, info))
    }

    async fn pr_comments(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<(CommentSet, RateLimitInfo)> {
        let data: PrData = self
            .execute(
                COMMENTS_QUERY,
                json!({ "owner": owner, "name": repo, "number": number }),
            )
            .await?;
        let info = data.rate_limit.normalise();
        let pull = data
            .repository
            .and_then(|r| r.pull_request)
            .ok_or_else(|| CaptureError::NotFound(format!("{owner}/{repo}#{number}")))?;

        let comments = pull.comment_set();
        let count = (comments.issue_comments.len() + comments.review_comments.len()) as u32;
        self.track("compound:comments", info, count);
        Ok((comments, info))
    }

    async fn recent_prs(
        &self,
        owner: &str,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<(Vec<PullRequest>, RateLimitInfo)> {
        let data: RecentData = self
            .execute(
                RECENT_QUERY,
                json!({ "owner": owner, "name": repo, "limit": limit.clamp(1, 100) as i64 }),
            )
            .await?;
        let info = data.rate_limit.normalise();
        let repository = data
            .repository
            .ok_or_else(|| CaptureError::NotFound(format!("{owner}/{repo}")))?;

        let prs: Vec<PullRequest> = repository
            .pull_requests
            .nodes
            .into_iter()
            .map(GqlPull::normalise)
            .filter(|pr| pr.updated_at >= since)
            .collect();
        self.track("compound:recent", info, prs.len() as u32);
        Ok((prs, info))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    errors: Option<Vec<GqlError>>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlRateLimit {
    cost: i64,
    remaining: i64,
    limit: i64,
    reset_at: Option<DateTime<Utc>>,
}

impl GqlRateLimit {
    fn normalise(&self) -> RateLimitInfo {
        RateLimitInfo {
            cost: self.cost,
            remaining: self.remaining,
            limit: self.limit,
            reset_at: self.reset_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrData {
    repository: Option<GqlPrRepository>,
    rate_limit: GqlRateLimit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPrRepository {
    pull_request: Option<GqlPull>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentData {
    repository: Option<GqlRecentRepository>,
    rate_limit: GqlRateLimit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlRecentRepository {
    pull_requests: Nodes<GqlPull>,
}

#[derive(Debug, Default, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlActor {
    login: String,
    avatar_url: Option<String>,
    database_id: Option<i64>,
}

impl GqlActor {
    fn normalise(self) -> Actor {
        Actor {
            github_id: self.database_id.unwrap_or_default(),
            login: self.login,
            avatar_url: self.avatar_url,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPull {
    database_id: Option<i64>,
    number: i32,
    title: String,
    body: Option<String>,
    state: String,
    is_draft: bool,
    #[serde(default)]
    additions: i64,
    #[serde(default)]
    deletions: i64,
    #[serde(default)]
    changed_files: i64,
    commits: Option<TotalCount>,
    author: Option<GqlActor>,
    merged_by: Option<GqlActor>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    merged: bool,
    mergeable: Option<String>,
    base_ref_name: String,
    head_ref_name: String,
    files: Option<Nodes<GqlFile>>,
    reviews: Option<Nodes<GqlReview>>,
    comments: Option<Nodes<GqlComment>>,
    review_threads: Option<Nodes<GqlReviewThread>>,
}

impl GqlPull {
    fn normalise(self) -> PullRequest {
        PullRequest {
            github_id: self.database_id.unwrap_or_default(),
            number: self.number,
            title: self.title,
            body: self.body,
            state: if self.state == "OPEN" {
                PrState::Open
            } else {
                PrState::Closed
            },
            draft: self.is_draft,
            additions: self.additions,
            deletions: self.deletions,
            changed_files: self.changed_files,
            commit_count: self.commits.map(|c| c.total_count).unwrap_or_default(),
            author: self.author.map(GqlActor::normalise),
            merged_by: self.merged_by.map(GqlActor::normalise),
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            merged_at: self.merged_at,
            merged: self.merged || self.merged_at.is_some(),
            mergeable: match self.mergeable.as_deref() {
                Some("MERGEABLE") => Some(true),
                Some("CONFLICTING") => Some(false),
                _ => None,
            },
            base_ref: self.base_ref_name,
            head_ref: self.head_ref_name,
        }
    }
}

impl GqlPull {
    /// Split the compound payload into the full normalised record.
    fn into_complete(mut self) -> PullRequestData {
        let files = self.files.take().map(|n| n.nodes).unwrap_or_default();
        let reviews = self.reviews.take().map(|n| n.nodes).unwrap_or_default();
        let issue_comments = self.comments.take().map(|n| n.nodes).unwrap_or_default();
        let threads = self.review_threads.take().map(|n| n.nodes).unwrap_or_default();

        let review_comments: Vec<PrComment> = threads
            .into_iter()
            .flat_map(|t| t.comments.nodes)
            .map(GqlComment::normalise)
            .collect();

        PullRequestData {
            files: files.into_iter().map(GqlFile::normalise).collect(),
            reviews: reviews.into_iter().map(GqlReview::normalise).collect(),
            issue_comments: issue_comments
                .into_iter()
                .map(GqlComment::normalise)
                .collect(),
            review_comments,
            pull_request: self.normalise(),
        }
    }

    fn comment_set(mut self) -> CommentSet {
        let issue_comments = self.comments.take().map(|n| n.nodes).unwrap_or_default();
        let threads = self.review_threads.take().map(|n| n.nodes).unwrap_or_default();
        CommentSet {
            issue_comments: issue_comments
                .into_iter()
                .map(GqlComment::normalise)
                .collect(),
            review_comments: threads
                .into_iter()
                .flat_map(|t| t.comments.nodes)
                .map(GqlComment::normalise)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TotalCount {
    total_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlFile {
    path: String,
    additions: i64,
    deletions: i64,
    change_type: Option<String>,
}

impl GqlFile {
    fn normalise(self) -> PrFile {
        PrFile {
            changes: self.additions + self.deletions,
            additions: self.additions,
            deletions: self.deletions,
            status: self
                .change_type
                .map(|c| c.to_ascii_lowercase())
                .unwrap_or_else(|| "modified".to_string()),
            filename: self.path,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlReview {
    database_id: Option<i64>,
    state: String,
    body: Option<String>,
    author: Option<GqlActor>,
    submitted_at: Option<DateTime<Utc>>,
    commit: Option<GqlCommit>,
}

#[derive(Debug, Deserialize)]
struct GqlCommit {
    oid: String,
}

impl GqlReview {
    fn normalise(self) -> PrReview {
        PrReview {
            github_id: self.database_id.unwrap_or_default(),
            state: self.state,
            body: self.body,
            author: self.author.map(GqlActor::normalise),
            submitted_at: self.submitted_at,
            commit_id: self.commit.map(|c| c.oid),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlComment {
    database_id: Option<i64>,
    body: String,
    author: Option<GqlActor>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    position: Option<i64>,
    #[serde(default)]
    original_position: Option<i64>,
    #[serde(default)]
    diff_hunk: Option<String>,
    #[serde(default)]
    reply_to: Option<CommentRef>,
    #[serde(default)]
    pull_request_review: Option<CommentRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentRef {
    database_id: Option<i64>,
}

impl GqlComment {
    fn normalise(self) -> PrComment {
        PrComment {
            github_id: self.database_id.unwrap_or_default(),
            body: self.body,
            author: self.author.map(GqlActor::normalise),
            created_at: self.created_at,
            updated_at: self.updated_at,
            path: self.path,
            position: self.position,
            original_position: self.original_position,
            diff_hunk: self.diff_hunk,
            in_reply_to_id: self.reply_to.and_then(|r| r.database_id),
            review_id: self.pull_request_review.and_then(|r| r.database_id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlReviewThread {
    comments: Nodes<GqlComment>,
}
