//! PostgreSQL health persistence

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shardline_types::{AccountId, ShardHealthState, ShardIdentity, ShardKey, ShardOutcome, MAX_PENALTY};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::{HealthPersistence, HealthUpsert};
use crate::error::{HealthError, HealthResult};

/// `shard_health` table backed persistence.
#[derive(Debug, Clone)]
pub struct PostgresHealthPersistence {
    pool: PgPool,
}

impl PostgresHealthPersistence {
    /// Connect and make sure the table exists.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> HealthResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| HealthError::Persistence(e.to_string()))?;

        let persistence = Self { pool };
        persistence.initialize_schema().await?;
        Ok(persistence)
    }

    /// Use an existing pool; the schema is assumed to exist.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> HealthResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shard_health (
                shard_key TEXT NOT NULL,
                account_id TEXT NOT NULL,
                penalty SMALLINT NOT NULL DEFAULT 0,
                cooldown_until TIMESTAMPTZ,
                success_count BIGINT NOT NULL DEFAULT 0,
                rate_limit_count BIGINT NOT NULL DEFAULT 0,
                failure_count BIGINT NOT NULL DEFAULT 0,
                last_outcome TEXT,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (shard_key, account_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HealthError::Persistence(e.to_string()))?;

        Ok(())
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> HealthResult<(ShardIdentity, ShardHealthState)> {
        let get_err = |e: sqlx::Error| HealthError::InvalidRecord(e.to_string());

        let shard_key: String = row.try_get("shard_key").map_err(get_err)?;
        let account_id: String = row.try_get("account_id").map_err(get_err)?;
        let penalty: i16 = row.try_get("penalty").map_err(get_err)?;
        let cooldown_until: Option<DateTime<Utc>> = row.try_get("cooldown_until").map_err(get_err)?;
        let success_count: i64 = row.try_get("success_count").map_err(get_err)?;
        let rate_limit_count: i64 = row.try_get("rate_limit_count").map_err(get_err)?;
        let failure_count: i64 = row.try_get("failure_count").map_err(get_err)?;
        let last_outcome: Option<String> = row.try_get("last_outcome").map_err(get_err)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(get_err)?;

        let identity = ShardIdentity::new(ShardKey::new(&shard_key), AccountId::new(account_id));
        let state = ShardHealthState {
            penalty: penalty.clamp(0, i16::from(MAX_PENALTY)) as u8,
            cooldown_until,
            success_count: success_count.max(0) as u64,
            rate_limit_count: rate_limit_count.max(0) as u64,
            failure_count: failure_count.max(0) as u64,
            last_outcome: last_outcome.as_deref().and_then(ShardOutcome::parse),
            updated_at,
        };
        Ok((identity, state))
    }
}

#[async_trait]
impl HealthPersistence for PostgresHealthPersistence {
    async fn upsert(&self, upsert: &HealthUpsert) -> HealthResult<()> {
        sqlx::query(
            r#"
            INSERT INTO shard_health (
                shard_key, account_id, penalty, cooldown_until,
                success_count, rate_limit_count, failure_count,
                last_outcome, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (shard_key, account_id) DO UPDATE SET
                penalty = EXCLUDED.penalty,
                cooldown_until = EXCLUDED.cooldown_until,
                success_count = shard_health.success_count + EXCLUDED.success_count,
                rate_limit_count = shard_health.rate_limit_count + EXCLUDED.rate_limit_count,
                failure_count = shard_health.failure_count + EXCLUDED.failure_count,
                last_outcome = EXCLUDED.last_outcome,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(upsert.identity.shard_key.as_str())
        .bind(upsert.identity.account_id.as_str())
        .bind(i16::from(upsert.penalty))
        .bind(upsert.cooldown_until)
        .bind(upsert.success_delta as i64)
        .bind(upsert.rate_limit_delta as i64)
        .bind(upsert.failure_delta as i64)
        .bind(upsert.last_outcome.map(|o| o.as_str()))
        .bind(upsert.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| HealthError::Persistence(e.to_string()))?;

        Ok(())
    }

    async fn load_all(&self) -> HealthResult<Vec<(ShardIdentity, ShardHealthState)>> {
        let rows = sqlx::query(
            r#"
            SELECT shard_key, account_id, penalty, cooldown_until,
                   success_count, rate_limit_count, failure_count,
                   last_outcome, updated_at
            FROM shard_health
            ORDER BY shard_key, account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HealthError::Persistence(e.to_string()))?;

        rows.iter().map(Self::row_to_state).collect()
    }
}
