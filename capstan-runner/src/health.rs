//! The health collaborator: reads in-flight job outcomes from the store
//! and, past the critical error-rate threshold, drives the automated
//! rollback and its verification.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use capstan_config::{CheckType, HealthParams, RollbackParams};
use capstan_core::rollout::RolloutController;
use capstan_core::store::ports::{JobErrorStats, JobStore};
use capstan_model::Result;

use crate::artifacts::ArtifactWriter;

/// Error rate at or above which the rollout is rolled back.
pub const CRITICAL_ERROR_RATE: f64 = 0.10;
/// Trailing window the stats cover.
pub const HEALTH_WINDOW_HOURS: i64 = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub check_type: String,
    pub window_hours: i64,
    pub total_jobs: i64,
    pub completed: i64,
    pub failed: i64,
    pub stale_processing: i64,
    pub error_rate: f64,
    pub status: HealthStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollbackReport {
    pub feature: String,
    pub rolled_back_to: u8,
    pub reason: String,
    pub triggered_by: String,
    /// `verified` when the read-back matched, `mismatch` otherwise.
    pub status: String,
    pub at: DateTime<Utc>,
}

/// What a health run concluded.
#[derive(Clone, Debug)]
pub enum HealthOutcome {
    Healthy(HealthReport),
    RolledBack {
        report: HealthReport,
        rollback: RollbackReport,
    },
    /// Rollback happened but verification disagreed — fatal for the caller.
    VerifyMismatch {
        report: HealthReport,
        rollback: RollbackReport,
    },
}

pub struct HealthChecker {
    jobs: Arc<dyn JobStore>,
    rollout: Arc<RolloutController>,
    feature: String,
}

impl HealthChecker {
    pub fn new(jobs: Arc<dyn JobStore>, rollout: Arc<RolloutController>, feature: String) -> Self {
        Self {
            jobs,
            rollout,
            feature,
        }
    }

    pub async fn run(
        &self,
        params: &HealthParams,
        rollback: &RollbackParams,
        artifacts: &ArtifactWriter,
    ) -> Result<HealthOutcome> {
        let stats = self.jobs.error_stats(Duration::hours(HEALTH_WINDOW_HOURS)).await?;
        let report = build_report(params.check_type, &stats);

        if let Err(err) = artifacts.write("health-report", &report) {
            tracing::warn!(target: "runner::health", error = %err, "failed to write health report");
        }

        tracing::info!(
            target: "runner::health",
            error_rate = report.error_rate,
            failed = report.failed,
            total = report.total_jobs,
            stale = report.stale_processing,
            status = ?report.status,
            "health check complete"
        );

        // FORCE_CHECK bypasses scheduling throttles upstream; it never
        // manufactures a rollback on its own.
        let may_act = matches!(params.check_type, CheckType::Full | CheckType::ErrorRates);
        let should_rollback = may_act && report.status == HealthStatus::Critical;
        if !should_rollback {
            return Ok(HealthOutcome::Healthy(report));
        }

        self.rollout
            .rollback(&self.feature, rollback.percentage, &rollback.reason)
            .await?;
        let verified = self
            .rollout
            .verify(&self.feature, rollback.percentage.clamp(0, 100) as u8)
            .await?;

        let rollback_report = RollbackReport {
            feature: self.feature.clone(),
            rolled_back_to: rollback.percentage.clamp(0, 100) as u8,
            reason: rollback.reason.clone(),
            triggered_by: rollback.triggered_by.clone(),
            status: if verified { "verified" } else { "mismatch" }.to_string(),
            at: Utc::now(),
        };
        if let Err(err) = artifacts.write("rollback-report", &rollback_report) {
            tracing::warn!(target: "runner::health", error = %err, "failed to write rollback report");
        }

        if verified {
            Ok(HealthOutcome::RolledBack {
                report,
                rollback: rollback_report,
            })
        } else {
            Ok(HealthOutcome::VerifyMismatch {
                report,
                rollback: rollback_report,
            })
        }
    }
}

fn build_report(check_type: CheckType, stats: &JobErrorStats) -> HealthReport {
    let error_rate = stats.error_rate();
    HealthReport {
        checked_at: Utc::now(),
        check_type: match check_type {
            CheckType::Full => "full",
            CheckType::ErrorRates => "error_rates",
            CheckType::MetricsOnly => "metrics_only",
        }
        .to_string(),
        window_hours: HEALTH_WINDOW_HOURS,
        total_jobs: stats.total,
        completed: stats.completed,
        failed: stats.failed,
        stale_processing: stats.stale_processing,
        error_rate,
        status: if error_rate >= CRITICAL_ERROR_RATE {
            HealthStatus::Critical
        } else {
            HealthStatus::Healthy
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use capstan_core::store::ports::{RepoRef, RolloutStore};
    use capstan_model::{
        CaptureJob, CaptureError, JobId, RepositoryCategory, RolloutAction, RolloutConfig,
        RolloutHistoryEntry, DEFAULT_FEATURE,
    };

    struct FixedStatsStore {
        stats: JobErrorStats,
    }

    #[async_trait]
    impl JobStore for FixedStatsStore {
        async fn insert_job(&self, _job: &CaptureJob) -> Result<()> {
            Ok(())
        }
        async fn mark_processing(&self, _id: JobId) -> Result<()> {
            Ok(())
        }
        async fn mark_completed(&self, _id: JobId) -> Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _id: JobId, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn set_external_run_id(&self, _id: JobId, _run_id: &str) -> Result<()> {
            Ok(())
        }
        async fn fetch_job(&self, _id: JobId) -> Result<Option<CaptureJob>> {
            Ok(None)
        }
        async fn repository(&self, _id: Uuid) -> Result<Option<RepoRef>> {
            Ok(None)
        }
        async fn error_stats(&self, _window: Duration) -> Result<JobErrorStats> {
            Ok(self.stats)
        }
    }

    #[derive(Default)]
    struct MemoryRollout {
        configs: Mutex<HashMap<String, RolloutConfig>>,
        history: Mutex<Vec<RolloutHistoryEntry>>,
    }

    #[async_trait]
    impl RolloutStore for MemoryRollout {
        async fn fetch_config(&self, feature: &str) -> Result<Option<RolloutConfig>> {
            Ok(self.configs.lock().await.get(feature).cloned())
        }

        async fn ensure_config(&self, feature: &str) -> Result<RolloutConfig> {
            let mut configs = self.configs.lock().await;
            Ok(configs
                .entry(feature.to_string())
                .or_insert_with(|| RolloutConfig::initial(feature))
                .clone())
        }

        async fn apply(
            &self,
            config: &RolloutConfig,
            entry: &RolloutHistoryEntry,
        ) -> Result<()> {
            self.configs
                .lock()
                .await
                .insert(config.feature.clone(), config.clone());
            self.history.lock().await.push(entry.clone());
            Ok(())
        }

        async fn history(
            &self,
            _feature: &str,
            _limit: i64,
        ) -> Result<Vec<RolloutHistoryEntry>> {
            Ok(self.history.lock().await.clone())
        }

        async fn repository_category(
            &self,
            _repository_id: Uuid,
        ) -> Result<Option<RepositoryCategory>> {
            Ok(None)
        }
    }

    fn stats(completed: i64, failed: i64) -> JobErrorStats {
        JobErrorStats {
            total: completed + failed,
            completed,
            failed,
            stale_processing: 0,
        }
    }

    fn checker(
        job_stats: JobErrorStats,
    ) -> (HealthChecker, Arc<MemoryRollout>, TempDir, ArtifactWriter) {
        let rollout_store = Arc::new(MemoryRollout::default());
        let rollout = Arc::new(RolloutController::new(
            Arc::clone(&rollout_store) as Arc<dyn RolloutStore>
        ));
        let checker = HealthChecker::new(
            Arc::new(FixedStatsStore { stats: job_stats }),
            rollout,
            DEFAULT_FEATURE.to_string(),
        );
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactWriter::new(dir.path());
        (checker, rollout_store, dir, artifacts)
    }

    fn params(check_type: CheckType) -> HealthParams {
        HealthParams {
            check_type,
            force_check: false,
        }
    }

    fn rollback_params() -> RollbackParams {
        RollbackParams {
            percentage: 0,
            reason: "Health monitor detected critical issues".to_string(),
            triggered_by: "automated_health_check".to_string(),
        }
    }

    #[tokio::test]
    async fn healthy_error_rate_does_not_roll_back() {
        let (checker, store, _dir, artifacts) = checker(stats(95, 5));
        let outcome = checker
            .run(&params(CheckType::Full), &rollback_params(), &artifacts)
            .await
            .unwrap();
        assert!(matches!(outcome, HealthOutcome::Healthy(_)));
        assert!(store.history.lock().await.is_empty());
    }

    #[tokio::test]
    async fn critical_error_rate_rolls_back_and_verifies() {
        let (checker, store, dir, artifacts) = checker(stats(90, 10));
        // Feature was ramped before the incident.
        {
            let mut configs = store.configs.lock().await;
            let mut config = RolloutConfig::initial(DEFAULT_FEATURE);
            config.percentage = 50;
            configs.insert(DEFAULT_FEATURE.to_string(), config);
        }

        let outcome = checker
            .run(&params(CheckType::Full), &rollback_params(), &artifacts)
            .await
            .unwrap();

        let HealthOutcome::RolledBack { report, rollback } = outcome else {
            panic!("expected rollback outcome");
        };
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(rollback.status, "verified");
        assert_eq!(rollback.triggered_by, "automated_health_check");

        let history = store.history.lock().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, RolloutAction::Rollback);
        assert_eq!(history[0].previous_percentage, 50);
        assert_eq!(history[0].new_percentage, 0);

        let configs = store.configs.lock().await;
        assert_eq!(configs.get(DEFAULT_FEATURE).unwrap().percentage, 0);

        // Both artifacts landed.
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("health-report-")));
        assert!(names.iter().any(|n| n.starts_with("rollback-report-")));
    }

    #[tokio::test]
    async fn metrics_only_never_acts() {
        let (checker, store, _dir, artifacts) = checker(stats(0, 10));
        let outcome = checker
            .run(
                &params(CheckType::MetricsOnly),
                &rollback_params(),
                &artifacts,
            )
            .await
            .unwrap();
        let HealthOutcome::Healthy(report) = outcome else {
            panic!("metrics_only must not roll back");
        };
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(store.history.lock().await.is_empty());
    }

    #[tokio::test]
    async fn emergency_stopped_rollback_surfaces_the_error() {
        let (checker, store, _dir, artifacts) = checker(stats(0, 10));
        {
            let mut configs = store.configs.lock().await;
            let mut config = RolloutConfig::initial(DEFAULT_FEATURE);
            config.emergency_stop = true;
            configs.insert(DEFAULT_FEATURE.to_string(), config);
        }

        let err = checker
            .run(&params(CheckType::ErrorRates), &rollback_params(), &artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::EmergencyStopped));
    }
}
