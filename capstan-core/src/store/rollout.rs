use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use capstan_model::{
    CaptureError, RepositoryCategory, Result, RolloutAction, RolloutConfig, RolloutHistoryEntry,
    RolloutStrategy,
};

use super::ports::RolloutStore;
use super::with_timeout;

#[derive(Clone, Debug)]
pub struct PostgresRolloutStore {
    pool: PgPool,
}

impl PostgresRolloutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_config(row: PgRow) -> Result<RolloutConfig> {
        let decode =
            |e: sqlx::Error| CaptureError::StoreError(format!("rollout row decode failed: {e}"));
        let strategy: String = row.try_get("strategy").map_err(decode)?;
        let whitelist: serde_json::Value = row.try_get("whitelist").map_err(decode)?;
        Ok(RolloutConfig {
            feature: row.try_get("feature").map_err(decode)?,
            percentage: row.try_get::<i16, _>("percentage").map_err(decode)? as u8,
            strategy: strategy.parse::<RolloutStrategy>()?,
            whitelist: serde_json::from_value(whitelist)?,
            emergency_stop: row.try_get("emergency_stop").map_err(decode)?,
            is_active: row.try_get("is_active").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }

    fn row_to_entry(row: PgRow) -> Result<RolloutHistoryEntry> {
        let decode =
            |e: sqlx::Error| CaptureError::StoreError(format!("history row decode failed: {e}"));
        let action: String = row.try_get("action").map_err(decode)?;
        Ok(RolloutHistoryEntry {
            id: row.try_get("id").map_err(decode)?,
            feature: row.try_get("feature").map_err(decode)?,
            action: action.parse::<RolloutAction>()?,
            previous_percentage: row.try_get::<i16, _>("previous_percentage").map_err(decode)?
                as u8,
            new_percentage: row.try_get::<i16, _>("new_percentage").map_err(decode)? as u8,
            reason: row.try_get("reason").map_err(decode)?,
            triggered_by: row.try_get("triggered_by").map_err(decode)?,
            metadata: row.try_get("metadata").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
        })
    }
}

#[async_trait]
impl RolloutStore for PostgresRolloutStore {
    async fn fetch_config(&self, feature: &str) -> Result<Option<RolloutConfig>> {
        let row = with_timeout(async {
            sqlx::query("SELECT * FROM rollout_configuration WHERE feature = $1")
                .bind(feature)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        row.map(Self::row_to_config).transpose()
    }

    async fn ensure_config(&self, feature: &str) -> Result<RolloutConfig> {
        if let Some(config) = self.fetch_config(feature).await? {
            return Ok(config);
        }

        let initial = RolloutConfig::initial(feature);
        let whitelist = serde_json::to_value(&initial.whitelist)?;
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO rollout_configuration
                    (feature, percentage, strategy, whitelist, emergency_stop, is_active, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (feature) DO NOTHING
                "#,
            )
            .bind(&initial.feature)
            .bind(initial.percentage as i16)
            .bind(initial.strategy.as_str())
            .bind(whitelist)
            .bind(initial.emergency_stop)
            .bind(initial.is_active)
            .bind(initial.updated_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await?;

        // Re-read: a concurrent writer may have won the insert race.
        self.fetch_config(feature)
            .await?
            .ok_or_else(|| CaptureError::StoreError("rollout row vanished after insert".into()))
    }

    async fn apply(&self, config: &RolloutConfig, entry: &RolloutHistoryEntry) -> Result<()> {
        let whitelist = serde_json::to_value(&config.whitelist)?;
        with_timeout(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                UPDATE rollout_configuration
                SET percentage = $2,
                    strategy = $3,
                    whitelist = $4,
                    emergency_stop = $5,
                    is_active = $6,
                    updated_at = $7
                WHERE feature = $1
                "#,
            )
            .bind(&config.feature)
            .bind(config.percentage as i16)
            .bind(config.strategy.as_str())
            .bind(whitelist)
            .bind(config.emergency_stop)
            .bind(config.is_active)
            .bind(config.updated_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO rollout_history
                    (id, feature, action, previous_percentage, new_percentage,
                     reason, triggered_by, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(entry.id)
            .bind(&entry.feature)
            .bind(entry.action.as_str())
            .bind(entry.previous_percentage as i16)
            .bind(entry.new_percentage as i16)
            .bind(&entry.reason)
            .bind(&entry.triggered_by)
            .bind(&entry.metadata)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await
        })
        .await
    }

    async fn history(&self, feature: &str, limit: i64) -> Result<Vec<RolloutHistoryEntry>> {
        let rows = with_timeout(async {
            sqlx::query(
                r#"
                SELECT * FROM rollout_history
                WHERE feature = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(feature)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn repository_category(
        &self,
        repository_id: Uuid,
    ) -> Result<Option<RepositoryCategory>> {
        let row = with_timeout(async {
            sqlx::query("SELECT category FROM repositories WHERE id = $1")
                .bind(repository_id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;

        Ok(row
            .and_then(|row| row.try_get::<Option<String>, _>("category").ok().flatten())
            .as_deref()
            .map(str::parse)
            .transpose()?)
    }
}
