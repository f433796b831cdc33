use std::future::Future;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use capstan_model::{
    BackendKind, CaptureError, CaptureJob, JobData, JobKind, Result,
};

use crate::store::ports::RepoRef;

use super::{CaptureContext, ProgressTracker};

/// Per-job item ceiling on the low-latency pool.
pub const LOW_LATENCY_ITEM_CAP: usize = 50;
/// Per-job item ceiling for batch runs without an explicit max.
const BATCH_ITEM_CAP: usize = 1000;
/// Consecutive item failures that abort the job.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
/// Back-off schedule for transport retries.
const TRANSPORT_BACKOFF: [StdDuration; 2] =
    [StdDuration::from_secs(1), StdDuration::from_secs(4)];
/// Longest a worker sleeps waiting for the budget window to reset.
const RATE_WAIT_CEILING: StdDuration = StdDuration::from_secs(60);
/// Item-derivation window when the caller gave none.
const DEFAULT_TIME_RANGE_DAYS: i64 = 30;

/// Executes one capture job sequentially, yielding at every forge and
/// store call so the pool stays responsive.
pub struct CaptureWorker {
    ctx: CaptureContext,
}

impl CaptureWorker {
    pub fn new(ctx: CaptureContext) -> Self {
        Self { ctx }
    }

    pub async fn run(
        &self,
        job: &CaptureJob,
        data: &JobData,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.ctx.jobs.mark_processing(job.id).await?;

        let repo = match self.ctx.jobs.repository(job.repository_id).await? {
            Some(repo) => repo,
            None => {
                let reason = format!("unknown repository {}", job.repository_id);
                self.ctx.jobs.mark_failed(job.id, &reason).await?;
                return Err(CaptureError::InvalidArgument(reason));
            }
        };

        let items = match self.resolve_items(job, data, &repo).await {
            Ok(items) => items,
            Err(err) => {
                self.ctx
                    .jobs
                    .mark_failed(job.id, &format!("item discovery failed: {err}"))
                    .await?;
                return Err(err);
            }
        };

        tracing::info!(
            target: "capture",
            job = %job.id,
            kind = %job.kind,
            repository = %repo.full_name(),
            items = items.len(),
            "capture started"
        );

        let tracker = ProgressTracker::new(
            std::sync::Arc::clone(&self.ctx.progress),
            job.id,
            items.len() as u32,
        );
        tracker.begin().await?;

        let mut consecutive_failures: u32 = 0;
        for number in items {
            if cancel.is_cancelled() {
                tracing::info!(target: "capture", job = %job.id, "capture cancelled");
                self.ctx.jobs.mark_failed(job.id, "cancelled").await?;
                return Err(CaptureError::Cancelled(format!("job {}", job.id)));
            }

            let item = format!("pr#{number}");
            tracker.item_started(&item).await?;

            match self.capture_item(job.kind, &repo, number).await {
                Ok(()) => {
                    consecutive_failures = 0;
                    tracker.success().await?;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        target: "capture",
                        job = %job.id,
                        item = %item,
                        error = %err,
                        "item capture failed"
                    );
                    tracker.failure(&item, err.to_string()).await?;

                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        let reason = format!(
                            "{consecutive_failures} consecutive item failures, last: {err}"
                        );
                        self.ctx.jobs.mark_failed(job.id, &reason).await?;
                        return Err(CaptureError::Internal(reason));
                    }
                }
            }
        }

        self.ctx.jobs.mark_completed(job.id).await?;
        let progress = tracker.snapshot().await;
        tracing::info!(
            target: "capture",
            job = %job.id,
            processed = progress.processed,
            failed = progress.failed,
            "capture finished"
        );
        Ok(())
    }

    /// Items for the job: explicit PR numbers win; otherwise details-like
    /// jobs derive from the store and historical syncs discover from the
    /// forge.
    async fn resolve_items(
        &self,
        job: &CaptureJob,
        data: &JobData,
        repo: &RepoRef,
    ) -> Result<Vec<i32>> {
        let cap = match job.backend {
            BackendKind::LowLatency => data
                .max_items
                .unwrap_or(LOW_LATENCY_ITEM_CAP)
                .min(LOW_LATENCY_ITEM_CAP),
            BackendKind::Batch => data.max_items.unwrap_or(BATCH_ITEM_CAP),
        };
        let since =
            Utc::now() - Duration::days(data.time_range_days.unwrap_or(DEFAULT_TIME_RANGE_DAYS));

        if !data.pr_numbers.is_empty() {
            return Ok(data.pr_numbers.iter().copied().take(cap).collect());
        }

        match job.kind {
            JobKind::HistoricalSync => {
                let prs = self
                    .forge_call(|| {
                        self.ctx
                            .forge
                            .recent_prs(&repo.owner, &repo.name, since, cap)
                    })
                    .await?;
                Ok(prs.into_iter().map(|pr| pr.number).collect())
            }
            _ => {
                self.ctx
                    .content
                    .recent_pr_numbers(repo.id, since, cap as i64)
                    .await
            }
        }
    }

    async fn capture_item(&self, kind: JobKind, repo: &RepoRef, number: i32) -> Result<()> {
        match kind {
            JobKind::Details | JobKind::FileChanges => {
                let record = self
                    .forge_call(|| {
                        self.ctx
                            .forge
                            .pr_complete_data(&repo.owner, &repo.name, number)
                    })
                    .await?;
                self.upsert_pull(repo, &record.pull_request).await?;
                Ok(())
            }
            JobKind::HistoricalSync => {
                let record = self
                    .forge_call(|| {
                        self.ctx
                            .forge
                            .pr_complete_data(&repo.owner, &repo.name, number)
                    })
                    .await?;
                let pr_id = self.upsert_pull(repo, &record.pull_request).await?;
                for review in &record.reviews {
                    idempotent(self.ctx.content.upsert_review(repo.id, pr_id, review).await)?;
                }
                for comment in record
                    .issue_comments
                    .iter()
                    .chain(record.review_comments.iter())
                {
                    idempotent(
                        self.ctx
                            .content
                            .upsert_comment(repo.id, pr_id, comment)
                            .await,
                    )?;
                }
                Ok(())
            }
            JobKind::Reviews => {
                let reviews = self
                    .forge_call(|| self.ctx.forge.pr_reviews(&repo.owner, &repo.name, number))
                    .await?;
                let pr_id = self.ensure_pull_row(repo, number).await?;
                for review in &reviews {
                    idempotent(self.ctx.content.upsert_review(repo.id, pr_id, review).await)?;
                }
                Ok(())
            }
            JobKind::Comments => {
                let comments = self
                    .forge_call(|| self.ctx.forge.pr_comments(&repo.owner, &repo.name, number))
                    .await?;
                let pr_id = self.ensure_pull_row(repo, number).await?;
                for comment in comments
                    .issue_comments
                    .iter()
                    .chain(comments.review_comments.iter())
                {
                    idempotent(
                        self.ctx
                            .content
                            .upsert_comment(repo.id, pr_id, comment)
                            .await,
                    )?;
                }
                Ok(())
            }
        }
    }

    async fn upsert_pull(
        &self,
        repo: &RepoRef,
        pull: &capstan_model::PullRequest,
    ) -> Result<uuid::Uuid> {
        match self.ctx.content.upsert_pull_request(repo.id, pull).await {
            Ok(id) => Ok(id),
            // A concurrent writer got there first; the row exists.
            Err(CaptureError::StoreConflict) => self
                .ctx
                .content
                .pull_request_id(repo.id, pull.number)
                .await?
                .ok_or_else(|| {
                    CaptureError::StoreError("conflicting pull request row not found".into())
                }),
            Err(err) => Err(err),
        }
    }

    /// Row id for a PR, reading the forge only when the store has no row
    /// yet.
    async fn ensure_pull_row(&self, repo: &RepoRef, number: i32) -> Result<uuid::Uuid> {
        if let Some(id) = self.ctx.content.pull_request_id(repo.id, number).await? {
            return Ok(id);
        }
        let record = self
            .forge_call(|| {
                self.ctx
                    .forge
                    .pr_complete_data(&repo.owner, &repo.name, number)
            })
            .await?;
        self.upsert_pull(repo, &record.pull_request).await
    }

    /// Retry policy for a forge read: up to two transport retries with
    /// exponential back-off, one retry after a rate-exhausted sleep, and
    /// everything else verbatim.
    async fn forge_call<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transport_retries = 0usize;
        let mut rate_retry_used = false;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err @ (CaptureError::Transport(_) | CaptureError::Timeout(_))) => {
                    if transport_retries >= TRANSPORT_BACKOFF.len() {
                        return Err(err);
                    }
                    let delay = TRANSPORT_BACKOFF[transport_retries];
                    transport_retries += 1;
                    tracing::debug!(
                        target: "capture",
                        error = %err,
                        retry = transport_retries,
                        "transport error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(CaptureError::RateExhausted { reset_at }) if !rate_retry_used => {
                    rate_retry_used = true;
                    let wait = reset_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .map(|until_reset| until_reset.min(RATE_WAIT_CEILING))
                        .unwrap_or(RATE_WAIT_CEILING);
                    tracing::warn!(
                        target: "capture",
                        wait_secs = wait.as_secs(),
                        "budget exhausted, sleeping until reset"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn idempotent(result: Result<()>) -> Result<()> {
    match result {
        Err(CaptureError::StoreConflict) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use uuid::Uuid;

    use capstan_model::{JobStatus, TriggerSource};

    use crate::store::ports::{ContentStore, JobStore};
    use crate::testing::{
        InMemoryContentStore, InMemoryJobStore, InMemoryProgressStore, ScriptedForge, repo_ref,
        sample_pull,
    };

    struct Fixture {
        worker: CaptureWorker,
        forge: Arc<ScriptedForge>,
        jobs: Arc<InMemoryJobStore>,
        progress: Arc<InMemoryProgressStore>,
        content: Arc<InMemoryContentStore>,
        repo_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let forge = Arc::new(ScriptedForge::default());
        let jobs = Arc::new(InMemoryJobStore::default());
        let progress = Arc::new(InMemoryProgressStore::default());
        let content = Arc::new(InMemoryContentStore::default());

        let repo_id = Uuid::new_v4();
        jobs.add_repository(repo_ref(repo_id)).await;

        let ctx = CaptureContext {
            forge: Arc::clone(&forge) as _,
            jobs: Arc::clone(&jobs) as _,
            progress: Arc::clone(&progress) as _,
            content: Arc::clone(&content) as _,
        };
        Fixture {
            worker: CaptureWorker::new(ctx),
            forge,
            jobs,
            progress,
            content,
            repo_id,
        }
    }

    fn details_job(repo_id: Uuid, pr_numbers: Vec<i32>) -> (CaptureJob, JobData) {
        let mut data = JobData::new(repo_id, "acme/widgets");
        data.pr_numbers = pr_numbers;
        data.trigger = TriggerSource::Manual;
        let job = CaptureJob::new(JobKind::Details, BackendKind::LowLatency, &data);
        (job, data)
    }

    #[tokio::test]
    async fn single_pr_details_capture_completes() {
        let f = fixture().await;
        let (job, data) = details_job(f.repo_id, vec![42]);
        f.jobs.insert_job(&job).await.unwrap();

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let stored = f.jobs.job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);

        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.failed, 0);

        assert!(f.content.pulls.lock().await.contains_key(&(f.repo_id, 42)));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_retried_then_succeed() {
        let f = fixture().await;
        let (job, data) = details_job(f.repo_id, vec![7]);
        f.jobs.insert_job(&job).await.unwrap();

        f.forge
            .fail_next(7, CaptureError::Transport("reset".into()))
            .await;
        f.forge
            .fail_next(7, CaptureError::Transport("reset".into()))
            .await;

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let calls = f.forge.calls.lock().await.clone();
        assert_eq!(calls.iter().filter(|c| *c == "complete:7").count(), 3);
        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transport_error_is_an_item_failure() {
        let f = fixture().await;
        let (job, data) = details_job(f.repo_id, vec![7, 8]);
        f.jobs.insert_job(&job).await.unwrap();

        for _ in 0..3 {
            f.forge
                .fail_next(7, CaptureError::Transport("reset".into()))
                .await;
        }

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let stored = f.jobs.job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed, "job survives item failure");
        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.recent_errors.len(), 1);
        assert_eq!(progress.recent_errors[0].item, "pr#7");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_exhaustion_sleeps_and_retries_once() {
        let f = fixture().await;
        let (job, data) = details_job(f.repo_id, vec![9]);
        f.jobs.insert_job(&job).await.unwrap();

        f.forge
            .fail_next(9, CaptureError::RateExhausted { reset_at: None })
            .await;

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_abort_the_job() {
        let f = fixture().await;
        let numbers: Vec<i32> = (1..=12).collect();
        let (job, data) = details_job(f.repo_id, numbers.clone());
        f.jobs.insert_job(&job).await.unwrap();

        for number in &numbers {
            // NotFound is terminal per call, no retries to wait out.
            f.forge
                .fail_next(*number, CaptureError::NotFound("gone".into()))
                .await;
        }

        let err = f
            .worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Internal(_)));

        let stored = f.jobs.job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.failed, 10, "aborted at the consecutive ceiling");
    }

    #[tokio::test]
    async fn cancellation_marks_the_job_failed() {
        let f = fixture().await;
        let (job, data) = details_job(f.repo_id, vec![1, 2, 3]);
        f.jobs.insert_job(&job).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.worker.run(&job, &data, cancel).await.unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled(_)));

        let stored = f.jobs.job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn empty_pr_numbers_derive_items_from_store() {
        let f = fixture().await;
        // Two PRs already captured; the forge must not be asked to list.
        for number in [5, 6] {
            f.content
                .upsert_pull_request(f.repo_id, &sample_pull(number))
                .await
                .unwrap();
        }

        let mut data = JobData::new(f.repo_id, "acme/widgets");
        data.time_range_days = Some(7);
        let job = CaptureJob::new(JobKind::Details, BackendKind::LowLatency, &data);
        f.jobs.insert_job(&job).await.unwrap();

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let calls = f.forge.calls.lock().await.clone();
        assert!(!calls.iter().any(|c| c.starts_with("recent")));
        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.processed, 2);
    }

    #[tokio::test]
    async fn historical_sync_discovers_from_the_forge() {
        let f = fixture().await;
        *f.forge.recent.lock().await = vec![sample_pull(11), sample_pull(12)];

        let mut data = JobData::new(f.repo_id, "acme/widgets");
        data.time_range_days = Some(180);
        data.max_items = Some(100);
        let job = CaptureJob::new(JobKind::HistoricalSync, BackendKind::Batch, &data);
        f.jobs.insert_job(&job).await.unwrap();

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let calls = f.forge.calls.lock().await.clone();
        assert!(calls.iter().any(|c| c.starts_with("recent")));

        let pulls = f.content.pulls.lock().await;
        assert!(pulls.contains_key(&(f.repo_id, 11)));
        assert!(pulls.contains_key(&(f.repo_id, 12)));
        // Historical sync also lands children.
        assert!(!f.forge.calls.lock().await.is_empty());
        assert_eq!(f.content.reviews.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn reviews_job_backfills_missing_pull_row() {
        let f = fixture().await;
        let mut data = JobData::new(f.repo_id, "acme/widgets");
        data.pr_numbers = vec![21];
        let job = CaptureJob::new(JobKind::Reviews, BackendKind::LowLatency, &data);
        f.jobs.insert_job(&job).await.unwrap();

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        assert!(f.content.pulls.lock().await.contains_key(&(f.repo_id, 21)));
        assert_eq!(f.content.reviews.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn low_latency_jobs_cap_their_item_list() {
        let f = fixture().await;
        let numbers: Vec<i32> = (1..=80).collect();
        let (job, data) = details_job(f.repo_id, numbers);
        f.jobs.insert_job(&job).await.unwrap();

        f.worker
            .run(&job, &data, CancellationToken::new())
            .await
            .unwrap();

        let progress = f.progress.rows.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(progress.total, LOW_LATENCY_ITEM_CAP as u32);
    }
}
