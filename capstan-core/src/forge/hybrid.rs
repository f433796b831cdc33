use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use capstan_model::{
    CaptureError, CommentSet, PrReview, PullRequest, PullRequestData, Result,
};

use crate::governor::RateLimitGovernor;

use super::compound::CompoundClient;
use super::metrics::{ForgeMetrics, QueryMetrics};
use super::rest::FineGrainedClient;
use super::traits::{CompoundReader, ForgeReader};

/// Bounded ceiling for any forge round-trip.
const FORGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Underlying REST calls per logical operation, used for the
/// fine-grained query counter.
const COMPLETE_CALLS: u64 = 5;
const REVIEW_CALLS: u64 = 1;
const COMMENT_CALLS: u64 = 2;
const RECENT_CALLS: u64 = 1;

/// Compound-first forge client with automatic fine-grained fallback.
///
/// Downstream workers never learn which path served a read: both are
/// normalised before they return. `NotFound` short-circuits — a missing
/// item is missing on either path.
pub struct HybridForgeClient {
    compound: Arc<dyn CompoundReader>,
    fine: Arc<dyn ForgeReader>,
    governor: Arc<RateLimitGovernor>,
    metrics: QueryMetrics,
    compound_enabled: AtomicBool,
}

impl HybridForgeClient {
    pub fn new(
        compound: Arc<dyn CompoundReader>,
        fine: Arc<dyn ForgeReader>,
        governor: Arc<RateLimitGovernor>,
        compound_enabled: bool,
    ) -> Self {
        Self {
            compound,
            fine,
            governor,
            metrics: QueryMetrics::default(),
            compound_enabled: AtomicBool::new(compound_enabled),
        }
    }

    /// Wire both concrete paths against a forge from one token.
    pub fn connect(
        api_base: &str,
        graphql_url: &str,
        token: &str,
        governor: Arc<RateLimitGovernor>,
        compound_enabled: bool,
    ) -> Result<Self> {
        let client = Arc::new(
            Client::builder()
                .timeout(FORGE_TIMEOUT)
                .build()
                .map_err(|e| CaptureError::Config(format!("forge client build failed: {e}")))?,
        );
        let compound = Arc::new(CompoundClient::new(
            Arc::clone(&client),
            graphql_url,
            token,
            Arc::clone(&governor),
        ));
        let fine = Arc::new(FineGrainedClient::new(
            client,
            api_base,
            token,
            Arc::clone(&governor),
        ));
        Ok(Self::new(compound, fine, governor, compound_enabled))
    }

    pub fn set_compound_enabled(&self, enabled: bool) {
        self.compound_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn compound_enabled(&self) -> bool {
        self.compound_enabled.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> ForgeMetrics {
        self.metrics.snapshot()
    }

    /// Refuse outright when the latest budget sample is below the critical
    /// threshold. The governor itself never blocks; this is the one place
    /// enforcement happens.
    fn admit(&self) -> Result<()> {
        let critical = self.governor.thresholds().critical_remaining;
        if let Some(remaining) = self.governor.latest_remaining()
            && remaining < critical
        {
            tracing::warn!(
                target: "forge::hybrid",
                remaining,
                critical,
                "refusing forge call, budget below critical threshold"
            );
            return Err(CaptureError::RateExhausted {
                reset_at: self.governor.latest_reset_at(),
            });
        }
        Ok(())
    }
}

/// Decide what to do with a compound-path outcome. `Ok` carries the value
/// and the points-saved accounting already applied; `Err(None)` means fall
/// back, `Err(Some(_))` is terminal.
macro_rules! compound_attempt {
    ($self:ident, $result:expr) => {
        match $result {
            Ok((value, info)) => {
                $self.metrics.record_compound();
                $self.metrics.record_points_saved(info.cost);
                return Ok(value);
            }
            Err(CaptureError::NotFound(item)) => {
                $self.metrics.record_compound();
                return Err(CaptureError::NotFound(item));
            }
            Err(err) => {
                $self.metrics.record_fallback();
                tracing::warn!(
                    target: "forge::hybrid",
                    error = %err,
                    "compound path failed, falling back to fine-grained"
                );
            }
        }
    };
}

#[async_trait]
impl ForgeReader for HybridForgeClient {
    async fn pr_complete_data(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<PullRequestData> {
        self.admit()?;
        if self.compound_enabled() {
            compound_attempt!(self, self.compound.pr_complete_data(owner, repo, number).await);
        }
        let record = self.fine.pr_complete_data(owner, repo, number).await?;
        self.metrics.record_fine_grained(COMPLETE_CALLS);
        Ok(record)
    }

    async fn pr_reviews(&self, owner: &str, repo: &str, number: i32) -> Result<Vec<PrReview>> {
        self.admit()?;
        if self.compound_enabled() {
            compound_attempt!(self, self.compound.pr_reviews(owner, repo, number).await);
        }
        let reviews = self.fine.pr_reviews(owner, repo, number).await?;
        self.metrics.record_fine_grained(REVIEW_CALLS);
        Ok(reviews)
    }

    async fn pr_comments(&self, owner: &str, repo: &str, number: i32) -> Result<CommentSet> {
        self.admit()?;
        if self.compound_enabled() {
            compound_attempt!(self, self.compound.pr_comments(owner, repo, number).await);
        }
        let comments = self.fine.pr_comments(owner, repo, number).await?;
        self.metrics.record_fine_grained(COMMENT_CALLS);
        Ok(comments)
    }

    async fn recent_prs(
        &self,
        owner: &str,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullRequest>> {
        self.admit()?;
        if self.compound_enabled() {
            compound_attempt!(self, self.compound.recent_prs(owner, repo, since, limit).await);
        }
        let prs = self.fine.recent_prs(owner, repo, since, limit).await?;
        self.metrics.record_fine_grained(RECENT_CALLS);
        Ok(prs)
    }
}
