use crate::config::DatabaseConfig;
use crate::quota::{DataAccessError, PlanUsageSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Row written for each stored artifact. Later usage counts observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub user_id: Uuid,
    pub project_id: Option<Uuid>,
    /// Reference value: object key or direct URL
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub file_size: usize,
}

impl ArtifactRecord {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Persists artifact records on behalf of the caller
#[async_trait]
pub trait ArtifactRecorder: Send + Sync {
    async fn record(&self, artifact: &ArtifactRecord) -> Result<Uuid, DataAccessError>;
}

/// PostgreSQL-backed plan/usage reader and artifact recorder
pub struct PgUsageStore {
    pool: PgPool,
    asset_type_id: Option<Uuid>,
}

impl PgUsageStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::pool_options(config)
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self {
            pool,
            asset_type_id: config.asset_type_id,
        })
    }

    /// Create a store whose connections are opened on first use
    #[cfg(test)]
    pub(crate) fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::pool_options(config)
            .connect_lazy(&config.url)
            .context("Invalid PostgreSQL connection URL")?;

        Ok(Self {
            pool,
            asset_type_id: config.asset_type_id,
        })
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
    }

    /// Get the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Readiness probe
    pub async fn ping(&self) -> Result<(), DataAccessError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PlanUsageSource for PgUsageStore {
    async fn active_plan_limit(&self, user_id: Uuid) -> Result<Option<i64>, DataAccessError> {
        let limit: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT plan.max_generations_per_month
            FROM plan
            JOIN subscription ON subscription.plan_id = plan.id
            WHERE subscription.user_id = $1
              AND subscription.active
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(limit.map(i64::from))
    }

    async fn usage_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<i64, DataAccessError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM generated_asset
            WHERE user_id = $1
              AND created_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[async_trait]
impl ArtifactRecorder for PgUsageStore {
    #[instrument(skip(self, artifact), fields(user_id = %artifact.user_id))]
    async fn record(&self, artifact: &ArtifactRecord) -> Result<Uuid, DataAccessError> {
        let id = Uuid::new_v4();
        let file_size = i32::try_from(artifact.file_size).map_err(|_| {
            DataAccessError::Unavailable(format!(
                "artifact of {} bytes exceeds the file_size column",
                artifact.file_size
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO generated_asset (
                id, url, format, resolution, file_size,
                project_id, user_id, asset_type_id, created_at
            ) VALUES (
                $1, $2, 'png', $3, $4,
                $5, $6, $7, NOW()
            )
            "#,
        )
        .bind(id)
        .bind(&artifact.url)
        .bind(artifact.resolution())
        .bind(file_size)
        .bind(artifact.project_id)
        .bind(artifact.user_id)
        .bind(self.asset_type_id)
        .execute(&self.pool)
        .await?;

        debug!(record_id = %id, url = %artifact.url, "Artifact recorded");

        Ok(id)
    }
}
