//! In-memory fakes shared by the unit tests in this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use capstan_model::{
    CaptureError, CaptureJob, CaptureProgress, CommentSet, JobId, PrComment, PrReview, PrState,
    PullRequest, PullRequestData, Result,
};

use crate::forge::ForgeReader;
use crate::store::ports::{
    ContentStore, JobErrorStats, JobStore, ProgressStore, RepoRef,
};

pub fn sample_pull(number: i32) -> PullRequest {
    let now = Utc::now();
    PullRequest {
        github_id: number as i64 * 1000,
        number,
        title: format!("pr #{number}"),
        body: None,
        state: PrState::Open,
        draft: false,
        additions: 5,
        deletions: 2,
        changed_files: 1,
        commit_count: 1,
        author: None,
        merged_by: None,
        created_at: now,
        updated_at: now,
        closed_at: None,
        merged_at: None,
        merged: false,
        mergeable: None,
        base_ref: "main".into(),
        head_ref: "topic".into(),
    }
}

pub fn sample_record(number: i32) -> PullRequestData {
    PullRequestData {
        pull_request: sample_pull(number),
        files: Vec::new(),
        reviews: vec![PrReview {
            github_id: number as i64 * 1000 + 1,
            state: "APPROVED".into(),
            body: None,
            author: None,
            submitted_at: Some(Utc::now()),
            commit_id: None,
        }],
        issue_comments: Vec::new(),
        review_comments: Vec::new(),
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    pub jobs: Mutex<HashMap<JobId, CaptureJob>>,
    pub repositories: Mutex<HashMap<Uuid, RepoRef>>,
}

impl InMemoryJobStore {
    pub async fn add_repository(&self, repo: RepoRef) {
        self.repositories.lock().await.insert(repo.id, repo);
    }

    pub async fn job(&self, id: JobId) -> Option<CaptureJob> {
        self.jobs.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &CaptureJob) -> Result<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn mark_processing(&self, id: JobId) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(&id) {
            job.mark_processing();
        }
        Ok(())
    }

    async fn mark_completed(&self, id: JobId) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(&id) {
            job.mark_completed();
        }
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(&id) {
            job.mark_failed(reason);
        }
        Ok(())
    }

    async fn set_external_run_id(&self, id: JobId, run_id: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(&id) {
            job.external_run_id = Some(run_id.to_string());
        }
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<CaptureJob>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn repository(&self, id: Uuid) -> Result<Option<RepoRef>> {
        Ok(self.repositories.lock().await.get(&id).cloned())
    }

    async fn error_stats(&self, _window: Duration) -> Result<JobErrorStats> {
        let jobs = self.jobs.lock().await;
        let completed = jobs
            .values()
            .filter(|j| j.status == capstan_model::JobStatus::Completed)
            .count() as i64;
        let failed = jobs
            .values()
            .filter(|j| j.status == capstan_model::JobStatus::Failed)
            .count() as i64;
        Ok(JobErrorStats {
            total: jobs.len() as i64,
            completed,
            failed,
            stale_processing: 0,
        })
    }
}

#[derive(Default)]
pub struct InMemoryProgressStore {
    pub rows: Mutex<HashMap<JobId, CaptureProgress>>,
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn upsert(&self, progress: &CaptureProgress) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(progress.job_id, progress.clone());
        Ok(())
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<CaptureProgress>> {
        Ok(self.rows.lock().await.get(&job_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryContentStore {
    pub pulls: Mutex<HashMap<(Uuid, i32), (Uuid, PullRequest)>>,
    pub reviews: Mutex<HashMap<i64, PrReview>>,
    pub comments: Mutex<HashMap<i64, PrComment>>,
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn upsert_pull_request(&self, repository_id: Uuid, pr: &PullRequest) -> Result<Uuid> {
        let mut pulls = self.pulls.lock().await;
        let entry = pulls
            .entry((repository_id, pr.number))
            .or_insert_with(|| (Uuid::new_v4(), pr.clone()));
        entry.1 = pr.clone();
        Ok(entry.0)
    }

    async fn upsert_review(
        &self,
        _repository_id: Uuid,
        _pull_request_id: Uuid,
        review: &PrReview,
    ) -> Result<()> {
        self.reviews
            .lock()
            .await
            .insert(review.github_id, review.clone());
        Ok(())
    }

    async fn upsert_comment(
        &self,
        _repository_id: Uuid,
        _pull_request_id: Uuid,
        comment: &PrComment,
    ) -> Result<()> {
        self.comments
            .lock()
            .await
            .insert(comment.github_id, comment.clone());
        Ok(())
    }

    async fn pull_request_id(&self, repository_id: Uuid, number: i32) -> Result<Option<Uuid>> {
        Ok(self
            .pulls
            .lock()
            .await
            .get(&(repository_id, number))
            .map(|(id, _)| *id))
    }

    async fn recent_pr_numbers(
        &self,
        repository_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i32>> {
        let pulls = self.pulls.lock().await;
        let mut rows: Vec<(DateTime<Utc>, i32)> = pulls
            .iter()
            .filter(|((repo, _), (_, pr))| *repo == repository_id && pr.updated_at >= since)
            .map(|((_, number), (_, pr))| (pr.updated_at, *number))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|(_, number)| number)
            .collect())
    }
}

/// Forge fake: per-PR queues of errors to emit before succeeding, plus a
/// fixed recent-PR listing.
#[derive(Default)]
pub struct ScriptedForge {
    pub errors: Mutex<HashMap<i32, VecDeque<CaptureError>>>,
    pub recent: Mutex<Vec<PullRequest>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedForge {
    pub async fn fail_next(&self, number: i32, error: CaptureError) {
        self.errors
            .lock()
            .await
            .entry(number)
            .or_default()
            .push_back(error);
    }

    async fn next_outcome(&self, op: &str, number: i32) -> Result<()> {
        self.calls.lock().await.push(format!("{op}:{number}"));
        if let Some(queue) = self.errors.lock().await.get_mut(&number)
            && let Some(err) = queue.pop_front()
        {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ForgeReader for ScriptedForge {
    async fn pr_complete_data(
        &self,
        _owner: &str,
        _repo: &str,
        number: i32,
    ) -> Result<PullRequestData> {
        self.next_outcome("complete", number).await?;
        Ok(sample_record(number))
    }

    async fn pr_reviews(&self, _owner: &str, _repo: &str, number: i32) -> Result<Vec<PrReview>> {
        self.next_outcome("reviews", number).await?;
        Ok(sample_record(number).reviews)
    }

    async fn pr_comments(&self, _owner: &str, _repo: &str, number: i32) -> Result<CommentSet> {
        self.next_outcome("comments", number).await?;
        Ok(CommentSet {
            issue_comments: vec![PrComment {
                github_id: number as i64 * 1000 + 2,
                body: "lgtm".into(),
                author: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                path: None,
                position: None,
                original_position: None,
                diff_hunk: None,
                in_reply_to_id: None,
                review_id: None,
            }],
            review_comments: Vec::new(),
        })
    }

    async fn recent_prs(
        &self,
        _owner: &str,
        _repo: &str,
        _since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullRequest>> {
        self.calls.lock().await.push("recent:0".into());
        Ok(self
            .recent
            .lock()
            .await
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

pub fn repo_ref(id: Uuid) -> RepoRef {
    RepoRef {
        id,
        owner: "acme".into(),
        name: "widgets".into(),
        category: None,
    }
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
