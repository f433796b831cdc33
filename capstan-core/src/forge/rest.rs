//! Fine-grained forge path: five independent REST reads per complete
//! pull-request record, each attributed a flat cost of one point.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use capstan_model::{
    Actor, CaptureError, CommentSet, PrComment, PrFile, PrReview, PrState, PullRequest,
    PullRequestData, RateLimitSample, Result,
};

use crate::governor::RateLimitGovernor;

use super::{BudgetHeaders, parse_budget_headers, transport};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Flat cost attributed to every fine-grained call.
const CALL_COST: i64 = 1;

pub struct FineGrainedClient {
    client: Arc<Client>,
    api_base: String,
    token: String,
    governor: Arc<RateLimitGovernor>,
}

impl FineGrainedClient {
    pub fn new(
        client: Arc<Client>,
        api_base: impl Into<String>,
        token: impl Into<String>,
        governor: Arc<RateLimitGovernor>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            token: token.into(),
            governor,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query_type: &str,
        items_hint: impl FnOnce(&T) -> u32,
    ) -> Result<T> {
        let url = format!("{}{path}", self.api_base);
        tracing::debug!(target: "forge::rest", %url, "forge read");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "capstan")
            .send()
            .await
            .map_err(transport)?;

        let budget = parse_budget_headers(response.headers());
        let response = check_status(response, budget.as_ref())?;

        let value: T = response.json().await.map_err(transport)?;
        if let Some(budget) = budget {
            let items = items_hint(&value);
            self.governor.track(
                RateLimitSample::new(budget.remaining, budget.limit, CALL_COST, query_type)
                    .with_items(items)
                    .with_reset_at(budget.reset_at),
            );
        }
        Ok(value)
    }
}

fn check_status(response: Response, budget: Option<&BudgetHeaders>) -> Result<Response> {
    match response.status() {
        StatusCode::NOT_FOUND => Err(CaptureError::NotFound(response.url().path().to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(CaptureError::RateExhausted {
            reset_at: budget.and_then(|b| b.reset_at),
        }),
        StatusCode::FORBIDDEN if budget.is_some_and(|b| b.remaining == 0) => {
            Err(CaptureError::RateExhausted {
                reset_at: budget.and_then(|b| b.reset_at),
            })
        }
        status if !status.is_success() => Err(CaptureError::Transport(format!(
            "forge returned status {status}"
        ))),
        _ => Ok(response),
    }
}

#[async_trait]
impl super::traits::ForgeReader for FineGrainedClient {
    async fn pr_complete_data(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<PullRequestData> {
        let pull: RestPull = self
            .get_json(
                &format!("/repos/{owner}/{repo}/pulls/{number}"),
                "rest:pull",
                |_| 1,
            )
            .await?;
        let files: Vec<RestFile> = self
            .get_json(
                &format!("/repos/{owner}/{repo}/pulls/{number}/files?per_page=100"),
                "rest:files",
                |f: &Vec<RestFile>| f.len() as u32,
            )
            .await?;
        let reviews = self.fetch_reviews(owner, repo, number).await?;
        let comments = self.fetch_comments(owner, repo, number).await?;

        Ok(PullRequestData {
            pull_request: pull.normalise(),
            files: files.into_iter().map(RestFile::normalise).collect(),
            reviews,
            issue_comments: comments.issue_comments,
            review_comments: comments.review_comments,
        })
    }

    async fn pr_reviews(&self, owner: &str, repo: &str, number: i32) -> Result<Vec<PrReview>> {
        self.fetch_reviews(owner, repo, number).await
    }

    async fn pr_comments(&self, owner: &str, repo: &str, number: i32) -> Result<CommentSet> {
        self.fetch_comments(owner, repo, number).await
    }

    async fn recent_prs(
        &self,
        owner: &str,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullRequest>> {
        let per_page = limit.clamp(1, 100);
        let pulls: Vec<RestPull> = self
            .get_json(
                &format!(
                    "/repos/{owner}/{repo}/pulls?state=all&sort=updated&direction=desc&per_page={per_page}"
                ),
                "rest:recent",
                |p: &Vec<RestPull>| p.len() as u32,
            )
            .await?;

        Ok(pulls
            .into_iter()
            .map(RestPull::normalise)
            .filter(|pr| pr.updated_at >= since)
            .take(limit)
            .collect())
    }
}

impl FineGrainedClient {
    async fn fetch_reviews(&self, owner: &str, repo: &str, number: i32) -> Result<Vec<PrReview>> {
        let reviews: Vec<RestReview> = self
            .get_json(
                &format!("/repos/{owner}/{repo}/pulls/{number}/reviews?per_page=100"),
                "rest:reviews",
                |r: &Vec<RestReview>| r.len() as u32,
            )
            .await?;
        Ok(reviews.into_iter().map(RestReview::normalise).collect())
    }

    async fn fetch_comments(&self, owner: &str, repo: &str, number: i32) -> Result<CommentSet> {
        let issue: Vec<RestComment> = self
            .get_json(
                &format!("/repos/{owner}/{repo}/issues/{number}/comments?per_page=100"),
                "rest:issue_comments",
                |c: &Vec<RestComment>| c.len() as u32,
            )
            .await?;
        let review: Vec<RestComment> = self
            .get_json(
                &format!("/repos/{owner}/{repo}/pulls/{number}/comments?per_page=100"),
                "rest:review_comments",
                |c: &Vec<RestComment>| c.len() as u32,
            )
            .await?;

        Ok(CommentSet {
            issue_comments: issue.into_iter().map(RestComment::normalise).collect(),
            review_comments: review.into_iter().map(RestComment::normalise).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RestUser {
    id: i64,
    login: String,
    avatar_url: Option<String>,
}

impl RestUser {
    fn normalise(self) -> Actor {
        Actor {
            github_id: self.id,
            login: self.login,
            avatar_url: self.avatar_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RestPull {
    id: i64,
    number: i32,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    additions: i64,
    #[serde(default)]
    deletions: i64,
    #[serde(default)]
    changed_files: i64,
    #[serde(default)]
    commits: i64,
    user: Option<RestUser>,
    merged_by: Option<RestUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    merged: bool,
    mergeable: Option<bool>,
    base: RestRef,
    head: RestRef,
}

impl RestPull {
    fn normalise(self) -> PullRequest {
        let merged = self.merged || self.merged_at.is_some();
        PullRequest {
            github_id: self.id,
            number: self.number,
            title: self.title,
            body: self.body,
            state: if self.state == "open" {
                PrState::Open
            } else {
                PrState::Closed
            },
            draft: self.draft,
            additions: self.additions,
            deletions: self.deletions,
            changed_files: self.changed_files,
            commit_count: self.commits,
            author: self.user.map(RestUser::normalise),
            merged_by: self.merged_by.map(RestUser::normalise),
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            merged_at: self.merged_at,
            merged,
            mergeable: self.mergeable,
            base_ref: self.base.name,
            head_ref: self.head.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestFile {
    filename: String,
    additions: i64,
    deletions: i64,
    changes: i64,
    status: String,
}

impl RestFile {
    fn normalise(self) -> PrFile {
        PrFile {
            filename: self.filename,
            additions: self.additions,
            deletions: self.deletions,
            changes: self.changes,
            status: self.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestReview {
    id: i64,
    state: String,
    body: Option<String>,
    user: Option<RestUser>,
    submitted_at: Option<DateTime<Utc>>,
    commit_id: Option<String>,
}

impl RestReview {
    fn normalise(self) -> PrReview {
        PrReview {
            github_id: self.id,
            state: self.state,
            body: self.body,
            author: self.user.map(RestUser::normalise),
            submitted_at: self.submitted_at,
            commit_id: self.commit_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestComment {
    id: i64,
    body: String,
    user: Option<RestUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    path: Option<String>,
    position: Option<i64>,
    original_position: Option<i64>,
    diff_hunk: Option<String>,
    in_reply_to_id: Option<i64>,
    pull_request_review_id: Option<i64>,
}

impl RestComment {
    fn normalise(self) -> PrComment {
        PrComment {
            github_id: self.id,
            body: self.body,
            author: self.user.map(RestUser::normalise),
            created_at: self.created_at,
            updated_at: self.updated_at,
            path: self.path,
            position: self.position,
            original_position: self.original_position,
            diff_hunk: self.diff_hunk,
            in_reply_to_id: self.in_reply_to_id,
            review_id: self.pull_request_review_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_pull_normalises_state_and_merge_flag() {
        let raw = serde_json::json!({
            "id": 9001,
            "number": 42,
            "title": "Add widget",
            "body": null,
            "state": "closed",
            "merged_at": "2025-06-01T12:00:00Z",
            "created_at": "2025-05-30T08:00:00Z",
            "updated_at": "2025-06-01T12:00:00Z",
            "base": {"ref": "main"},
            "head": {"ref": "feature/widget"},
            "user": {"id": 7, "login": "octocat", "avatar_url": null}
        });
        let pull: RestPull = serde_json::from_value(raw).unwrap();
        let normalised = pull.normalise();
        assert_eq!(normalised.state, PrState::Closed);
        assert!(normalised.merged, "merged_at implies merged");
        assert_eq!(normalised.base_ref, "main");
        assert_eq!(normalised.author.as_ref().unwrap().login, "octocat");
    }

    #[test]
    fn rest_comment_keeps_review_thread_fields() {
        let raw = serde_json::json!({
            "id": 11,
            "body": "nit",
            "user": null,
            "created_at": "2025-06-01T12:00:00Z",
            "updated_at": "2025-06-01T12:00:00Z",
            "path": "src/lib.rs",
            "position": 4,
            "diff_hunk": "@@ -1 +1 @@",
            "pull_request_review_id": 77
        });
        let comment: RestComment = serde_json::from_value(raw).unwrap();
        let normalised = comment.normalise();
        assert!(normalised.is_review_comment());
        assert_eq!(normalised.review_id, Some(77));
    }
}
