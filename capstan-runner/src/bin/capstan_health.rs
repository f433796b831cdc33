//! Health-check runner: computes job error rates from the store and
//! drives the automated rollback (with verification) past the critical
//! threshold. Writes health and rollback artifacts either way.

use std::env;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use capstan_config::{Config, HealthParams, RollbackParams};
use capstan_core::rollout::RolloutController;
use capstan_core::store::{
    self, PostgresJobStore, PostgresRolloutStore, ensure_schema,
    ports::{JobStore, RolloutStore},
};
use capstan_model::DEFAULT_FEATURE;
use capstan_runner::{ArtifactWriter, HealthChecker, HealthOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let params = HealthParams::from_env()?;
    let rollback = RollbackParams::from_env()?;

    let pool = store::connect(&config.store.database_url).await?;
    ensure_schema(&pool).await?;

    let jobs = Arc::new(PostgresJobStore::new(pool.clone())) as Arc<dyn JobStore>;
    let rollout = Arc::new(RolloutController::new(
        Arc::new(PostgresRolloutStore::new(pool)) as Arc<dyn RolloutStore>,
    ));

    let artifacts = ArtifactWriter::new(
        env::var("ARTIFACT_DIR").unwrap_or_else(|_| ".".to_string()),
    );
    let checker = HealthChecker::new(jobs, rollout, DEFAULT_FEATURE.to_string());

    match checker.run(&params, &rollback, &artifacts).await? {
        HealthOutcome::Healthy(report) => {
            tracing::info!(error_rate = report.error_rate, "system healthy");
            Ok(())
        }
        HealthOutcome::RolledBack { report, rollback } => {
            tracing::warn!(
                error_rate = report.error_rate,
                rolled_back_to = rollback.rolled_back_to,
                "rollout rolled back and verified"
            );
            Ok(())
        }
        HealthOutcome::VerifyMismatch { rollback, .. } => {
            anyhow::bail!(
                "rollback verification mismatch for {}: store does not reflect {}%",
                rollback.feature,
                rollback.rolled_back_to
            )
        }
    }
}
