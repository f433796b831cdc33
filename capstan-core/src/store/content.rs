use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use capstan_model::{CaptureError, PrComment, PrReview, PullRequest, Result};

use super::ports::ContentStore;
use super::with_timeout;

#[derive(Clone, Debug)]
pub struct PostgresContentStore {
    pool: PgPool,
}

impl PostgresContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PostgresContentStore {
    async fn upsert_pull_request(&self, repository_id: Uuid, pr: &PullRequest) -> Result<Uuid> {
        let row = with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO pull_requests
                    (id, repository_id, github_id, number, title, body, state, draft,
                     additions, deletions, changed_files, commit_count,
                     author_github_id, author_login, merged_by_github_id, merged_by_login,
                     created_at, updated_at, closed_at, merged_at, merged, mergeable,
                     base_ref, head_ref)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
                ON CONFLICT (repository_id, number) DO UPDATE
                SET github_id = EXCLUDED.github_id,
                    title = EXCLUDED.title,
                    body = EXCLUDED.body,
                    state = EXCLUDED.state,
                    draft = EXCLUDED.draft,
                    additions = EXCLUDED.additions,
                    deletions = EXCLUDED.deletions,
                    changed_files = EXCLUDED.changed_files,
                    commit_count = EXCLUDED.commit_count,
                    author_github_id = EXCLUDED.author_github_id,
                    author_login = EXCLUDED.author_login,
                    merged_by_github_id = EXCLUDED.merged_by_github_id,
                    merged_by_login = EXCLUDED.merged_by_login,
                    updated_at = EXCLUDED.updated_at,
                    closed_at = EXCLUDED.closed_at,
                    merged_at = EXCLUDED.merged_at,
                    merged = EXCLUDED.merged,
                    mergeable = EXCLUDED.mergeable,
                    base_ref = EXCLUDED.base_ref,
                    head_ref = EXCLUDED.head_ref
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(repository_id)
            .bind(pr.github_id)
            .bind(pr.number)
            .bind(&pr.title)
            .bind(&pr.body)
            .bind(pr.state.as_str())
            .bind(pr.draft)
            .bind(pr.additions)
            .bind(pr.deletions)
            .bind(pr.changed_files)
            .bind(pr.commit_count)
            .bind(pr.author.as_ref().map(|a| a.github_id))
            .bind(pr.author.as_ref().map(|a| a.login.as_str()))
            .bind(pr.merged_by.as_ref().map(|a| a.github_id))
            .bind(pr.merged_by.as_ref().map(|a| a.login.as_str()))
            .bind(pr.created_at)
            .bind(pr.updated_at)
            .bind(pr.closed_at)
            .bind(pr.merged_at)
            .bind(pr.merged)
            .bind(pr.mergeable)
            .bind(&pr.base_ref)
            .bind(&pr.head_ref)
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        row.try_get("id")
            .map_err(|e| CaptureError::StoreError(format!("pull request id decode failed: {e}")))
    }

    async fn upsert_review(
        &self,
        repository_id: Uuid,
        pull_request_id: Uuid,
        review: &PrReview,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO reviews
                    (id, repository_id, pull_request_id, github_id, state, body,
                     author_github_id, author_login, submitted_at, commit_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (github_id) DO UPDATE
                SET state = EXCLUDED.state,
                    body = EXCLUDED.body,
                    submitted_at = EXCLUDED.submitted_at,
                    commit_id = EXCLUDED.commit_id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(repository_id)
            .bind(pull_request_id)
            .bind(review.github_id)
            .bind(&review.state)
            .bind(&review.body)
            .bind(review.author.as_ref().map(|a| a.github_id))
            .bind(review.author.as_ref().map(|a| a.login.as_str()))
            .bind(review.submitted_at)
            .bind(&review.commit_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn upsert_comment(
        &self,
        repository_id: Uuid,
        pull_request_id: Uuid,
        comment: &PrComment,
    ) -> Result<()> {
        let comment_type = if comment.is_review_comment() {
            "review"
        } else {
            "issue"
        };
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO comments
                    (id, repository_id, pull_request_id, github_id, comment_type, body,
                     author_github_id, author_login, created_at, updated_at,
                     path, position, original_position, diff_hunk, in_reply_to_id, review_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (github_id) DO UPDATE
                SET body = EXCLUDED.body,
                    updated_at = EXCLUDED.updated_at,
                    position = EXCLUDED.position,
                    diff_hunk = EXCLUDED.diff_hunk
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(repository_id)
            .bind(pull_request_id)
            .bind(comment.github_id)
            .bind(comment_type)
            .bind(&comment.body)
            .bind(comment.author.as_ref().map(|a| a.github_id))
            .bind(comment.author.as_ref().map(|a| a.login.as_str()))
            .bind(comment.created_at)
            .bind(comment.updated_at)
            .bind(&comment.path)
            .bind(comment.position)
            .bind(comment.original_position)
            .bind(&comment.diff_hunk)
            .bind(comment.in_reply_to_id)
            .bind(comment.review_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn pull_request_id(&self, repository_id: Uuid, number: i32) -> Result<Option<Uuid>> {
        let row = with_timeout(async {
            sqlx::query("SELECT id FROM pull_requests WHERE repository_id = $1 AND number = $2")
                .bind(repository_id)
                .bind(number)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;

        row.map(|row| {
            row.try_get("id").map_err(|e| {
                CaptureError::StoreError(format!("pull request id decode failed: {e}"))
            })
        })
        .transpose()
    }

    async fn recent_pr_numbers(
        &self,
        repository_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i32>> {
        let rows = with_timeout(async {
            sqlx::query(
                r#"
                SELECT number FROM pull_requests
                WHERE repository_id = $1 AND updated_at >= $2
                ORDER BY updated_at DESC
                LIMIT $3
                "#,
            )
            .bind(repository_id)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        rows.into_iter()
            .map(|row| {
                row.try_get("number")
                    .map_err(|e| CaptureError::StoreError(format!("number decode failed: {e}")))
            })
            .collect()
    }
}
