//! Rollout controller: gates what fraction of traffic may use hybrid
//! routing, records every change in the append-only history, and backs
//! the automated emergency rollback.

pub mod gate;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use capstan_model::{
    CaptureError, Result, RolloutAction, RolloutConfig, RolloutHistoryEntry,
};

use crate::store::ports::RolloutStore;

pub use gate::{admits, stable_percentage_hash};

/// Gate reads may be served from cache this long; everything else reads
/// the live row.
const GATE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Triggered-by tag for operator-driven changes.
pub const TRIGGER_MANUAL: &str = "manual";
/// Triggered-by tag for the health collaborator.
pub const TRIGGER_HEALTH_CHECK: &str = "automated_health_check";

struct CachedConfig {
    config: RolloutConfig,
    fetched_at: Instant,
}

pub struct RolloutController {
    store: Arc<dyn RolloutStore>,
    cache: Mutex<HashMap<String, CachedConfig>>,
}

impl RolloutController {
    pub fn new(store: Arc<dyn RolloutStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Live configuration, inserting the initial row on first touch.
    pub async fn query(&self, feature: &str) -> Result<RolloutConfig> {
        self.store.ensure_config(feature).await
    }

    /// Operator-facing percentage change. Percentage is validated here so
    /// out-of-range input never reaches the store and never writes history.
    pub async fn update(
        &self,
        feature: &str,
        new_percentage: i64,
        reason: &str,
    ) -> Result<RolloutConfig> {
        self.change_percentage(
            feature,
            new_percentage,
            reason,
            RolloutAction::Updated,
            TRIGGER_MANUAL,
        )
        .await
    }

    /// Same operation as `update`, recorded as an automated rollback.
    pub async fn rollback(
        &self,
        feature: &str,
        new_percentage: i64,
        reason: &str,
    ) -> Result<RolloutConfig> {
        tracing::warn!(
            target: "rollout",
            feature,
            new_percentage,
            reason,
            "automated rollback triggered"
        );
        self.change_percentage(
            feature,
            new_percentage,
            reason,
            RolloutAction::Rollback,
            TRIGGER_HEALTH_CHECK,
        )
        .await
    }

    async fn change_percentage(
        &self,
        feature: &str,
        new_percentage: i64,
        reason: &str,
        action: RolloutAction,
        triggered_by: &str,
    ) -> Result<RolloutConfig> {
        if !(0..=100).contains(&new_percentage) {
            return Err(CaptureError::InvalidArgument(format!(
                "percentage must be within [0, 100], got {new_percentage}"
            )));
        }
        let new_percentage = new_percentage as u8;

        let current = self.store.ensure_config(feature).await?;
        if current.emergency_stop {
            return Err(CaptureError::EmergencyStopped);
        }

        let mut next = current.clone();
        next.percentage = new_percentage;
        next.updated_at = Utc::now();

        let entry = RolloutHistoryEntry::record(
            feature,
            action,
            current.percentage,
            new_percentage,
            reason,
            triggered_by,
        );
        self.store.apply(&next, &entry).await?;
        self.invalidate(feature);

        tracing::info!(
            target: "rollout",
            feature,
            previous = current.percentage,
            new = new_percentage,
            action = action.as_str(),
            "rollout percentage changed"
        );
        Ok(next)
    }

    /// Emergency stop: deactivates the feature and zeroes the effective
    /// percentage until `resume`.
    pub async fn stop(&self, feature: &str, reason: &str) -> Result<RolloutConfig> {
        let current = self.store.ensure_config(feature).await?;

        let mut next = current.clone();
        next.emergency_stop = true;
        next.is_active = false;
        next.updated_at = Utc::now();

        let entry = RolloutHistoryEntry::record(
            feature,
            RolloutAction::Stop,
            current.percentage,
            current.percentage,
            reason,
            TRIGGER_MANUAL,
        );
        self.store.apply(&next, &entry).await?;
        self.invalidate(feature);

        tracing::warn!(target: "rollout", feature, reason, "emergency stop engaged");
        Ok(next)
    }

    /// Lift an emergency stop; the stored percentage and strategy come
    /// back into effect unchanged.
    pub async fn resume(&self, feature: &str, reason: &str) -> Result<RolloutConfig> {
        let current = self.store.ensure_config(feature).await?;

        let mut next = current.clone();
        next.emergency_stop = false;
        next.is_active = true;
        next.updated_at = Utc::now();

        let entry = RolloutHistoryEntry::record(
            feature,
            RolloutAction::Resume,
            current.percentage,
            current.percentage,
            reason,
            TRIGGER_MANUAL,
        );
        self.store.apply(&next, &entry).await?;
        self.invalidate(feature);

        tracing::info!(target: "rollout", feature, reason, "emergency stop lifted");
        Ok(next)
    }

    pub async fn history(&self, feature: &str, limit: i64) -> Result<Vec<RolloutHistoryEntry>> {
        self.store.history(feature, limit).await
    }

    /// The admission gate the router consults. Served from a cache no
    /// older than a minute; the decision itself is pure.
    pub async fn is_allowed(&self, feature: &str, repository_id: Uuid) -> Result<bool> {
        let config = self.cached_config(feature).await?;
        let category = if config.strategy == capstan_model::RolloutStrategy::RepositorySize {
            self.store.repository_category(repository_id).await?
        } else {
            None
        };
        Ok(gate::admits(&config, repository_id, category))
    }

    /// Read back the live row and confirm the effective percentage.
    /// A mismatch after rollback is a fatal alert for the caller.
    pub async fn verify(&self, feature: &str, expected_percentage: u8) -> Result<bool> {
        let config = self.store.ensure_config(feature).await?;
        let matches = config.effective_percentage() == expected_percentage;
        if !matches {
            tracing::error!(
                target: "rollout",
                feature,
                expected = expected_percentage,
                effective = config.effective_percentage(),
                "rollout verification mismatch"
            );
        }
        Ok(matches)
    }

    async fn cached_config(&self, feature: &str) -> Result<RolloutConfig> {
        {
            let cache = self.cache.lock().expect("rollout cache poisoned");
            if let Some(cached) = cache.get(feature)
                && cached.fetched_at.elapsed() < GATE_CACHE_TTL
            {
                return Ok(cached.config.clone());
            }
        }

        let config = self.store.ensure_config(feature).await?;
        let mut cache = self.cache.lock().expect("rollout cache poisoned");
        cache.insert(
            feature.to_string(),
            CachedConfig {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(config)
    }

    fn invalidate(&self, feature: &str) {
        let mut cache = self.cache.lock().expect("rollout cache poisoned");
        cache.remove(feature);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    use capstan_model::RepositoryCategory;

    use super::*;

    /// In-memory stand-in honouring the atomic apply contract.
    #[derive(Default)]
    pub struct InMemoryRolloutStore {
        pub state: TokioMutex<InMemoryState>,
    }

    #[derive(Default)]
    pub struct InMemoryState {
        pub configs: HashMap<String, RolloutConfig>,
        pub history: Vec<RolloutHistoryEntry>,
        pub categories: HashMap<Uuid, RepositoryCategory>,
    }

    #[async_trait]
    impl RolloutStore for InMemoryRolloutStore {
        async fn fetch_config(&self, feature: &str) -> Result<Option<RolloutConfig>> {
            Ok(self.state.lock().await.configs.get(feature).cloned())
        }

        async fn ensure_config(&self, feature: &str) -> Result<RolloutConfig> {
            let mut state = self.state.lock().await;
            Ok(state
                .configs
                .entry(feature.to_string())
                .or_insert_with(|| RolloutConfig::initial(feature))
                .clone())
        }

        async fn apply(
            &self,
            config: &RolloutConfig,
            entry: &RolloutHistoryEntry,
        ) -> Result<()> {
            let mut state = self.state.lock().await;
            state
                .configs
                .insert(config.feature.clone(), config.clone());
            state.history.push(entry.clone());
            Ok(())
        }

        async fn history(&self, feature: &str, limit: i64) -> Result<Vec<RolloutHistoryEntry>> {
            let state = self.state.lock().await;
            let mut entries: Vec<RolloutHistoryEntry> = state
                .history
                .iter()
                .filter(|e| e.feature == feature)
                .cloned()
                .collect();
            entries.reverse();
            entries.truncate(limit as usize);
            Ok(entries)
        }

        async fn repository_category(
            &self,
            repository_id: Uuid,
        ) -> Result<Option<RepositoryCategory>> {
            Ok(self.state.lock().await.categories.get(&repository_id).copied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::InMemoryRolloutStore;
    use super::*;
    use capstan_model::DEFAULT_FEATURE;

    fn controller() -> (RolloutController, Arc<InMemoryRolloutStore>) {
        let store = Arc::new(InMemoryRolloutStore::default());
        (
            RolloutController::new(Arc::clone(&store) as Arc<dyn RolloutStore>),
            store,
        )
    }

    #[tokio::test]
    async fn update_writes_config_and_history_entry() {
        let (controller, store) = controller();
        let config = controller
            .update(DEFAULT_FEATURE, 25, "initial rollout")
            .await
            .unwrap();
        assert_eq!(config.percentage, 25);

        let state = store.state.lock().await;
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].previous_percentage, 0);
        assert_eq!(state.history[0].new_percentage, 25);
        assert_eq!(state.history[0].triggered_by, TRIGGER_MANUAL);
    }

    #[tokio::test]
    async fn out_of_range_updates_fail_without_history() {
        let (controller, store) = controller();
        for bad in [-1i64, 101] {
            let err = controller
                .update(DEFAULT_FEATURE, bad, "nope")
                .await
                .unwrap_err();
            assert!(matches!(err, CaptureError::InvalidArgument(_)));
        }
        assert!(store.state.lock().await.history.is_empty());
    }

    #[tokio::test]
    async fn boundary_percentages_are_accepted() {
        let (controller, _) = controller();
        assert_eq!(
            controller
                .update(DEFAULT_FEATURE, 0, "off")
                .await
                .unwrap()
                .percentage,
            0
        );
        assert_eq!(
            controller
                .update(DEFAULT_FEATURE, 100, "full")
                .await
                .unwrap()
                .percentage,
            100
        );
    }

    #[tokio::test]
    async fn update_is_rejected_while_stopped() {
        let (controller, store) = controller();
        controller
            .update(DEFAULT_FEATURE, 50, "ramp")
            .await
            .unwrap();
        controller
            .stop(DEFAULT_FEATURE, "incident")
            .await
            .unwrap();

        let history_before = store.state.lock().await.history.len();
        let err = controller
            .update(DEFAULT_FEATURE, 75, "manual")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::EmergencyStopped));

        let state = store.state.lock().await;
        assert_eq!(state.history.len(), history_before, "no entry for the rejected update");
        let config = state.configs.get(DEFAULT_FEATURE).unwrap();
        assert_eq!(config.percentage, 50);
        assert!(config.emergency_stop);
        assert!(!config.is_active);
    }

    #[tokio::test]
    async fn stop_then_resume_restores_pre_stop_configuration() {
        let (controller, store) = controller();
        controller
            .update(DEFAULT_FEATURE, 40, "ramp")
            .await
            .unwrap();

        controller.stop(DEFAULT_FEATURE, "incident").await.unwrap();
        let stopped = controller.query(DEFAULT_FEATURE).await.unwrap();
        assert_eq!(stopped.effective_percentage(), 0);

        let resumed = controller
            .resume(DEFAULT_FEATURE, "resolved")
            .await
            .unwrap();
        assert_eq!(resumed.percentage, 40);
        assert!(resumed.is_active);
        assert!(!resumed.emergency_stop);

        let state = store.state.lock().await;
        let actions: Vec<RolloutAction> = state.history.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                RolloutAction::Updated,
                RolloutAction::Stop,
                RolloutAction::Resume
            ]
        );
    }

    #[tokio::test]
    async fn redundant_updates_write_two_entries_one_config() {
        let (controller, store) = controller();
        controller.update(DEFAULT_FEATURE, 30, "a").await.unwrap();
        controller.update(DEFAULT_FEATURE, 30, "b").await.unwrap();

        let state = store.state.lock().await;
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.configs.get(DEFAULT_FEATURE).unwrap().percentage, 30);
    }

    #[tokio::test]
    async fn rollback_is_tagged_as_automated() {
        let (controller, store) = controller();
        controller.update(DEFAULT_FEATURE, 60, "ramp").await.unwrap();
        controller
            .rollback(DEFAULT_FEATURE, 0, "Health monitor detected critical issues")
            .await
            .unwrap();

        assert!(controller.verify(DEFAULT_FEATURE, 0).await.unwrap());

        let state = store.state.lock().await;
        let last = state.history.last().unwrap();
        assert_eq!(last.action, RolloutAction::Rollback);
        assert_eq!(last.triggered_by, TRIGGER_HEALTH_CHECK);
        assert_eq!(last.previous_percentage, 60);
        assert_eq!(last.new_percentage, 0);
    }

    #[tokio::test]
    async fn is_allowed_is_deterministic_per_configuration() {
        let (controller, _) = controller();
        controller.update(DEFAULT_FEATURE, 50, "ramp").await.unwrap();

        let repo = Uuid::new_v4();
        let first = controller.is_allowed(DEFAULT_FEATURE, repo).await.unwrap();
        for _ in 0..5 {
            assert_eq!(
                controller.is_allowed(DEFAULT_FEATURE, repo).await.unwrap(),
                first
            );
        }
    }

    #[tokio::test]
    async fn gate_sees_changes_immediately_after_update() {
        let (controller, _) = controller();
        let repo = Uuid::new_v4();
        assert!(!controller.is_allowed(DEFAULT_FEATURE, repo).await.unwrap());

        controller.update(DEFAULT_FEATURE, 100, "open").await.unwrap();
        assert!(controller.is_allowed(DEFAULT_FEATURE, repo).await.unwrap());
    }
}
