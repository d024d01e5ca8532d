//! PostgreSQL run store.
//!
//! Enable with the `postgres` feature flag. Uniqueness of
//! (provider, model, attempt_at) is a table constraint, so concurrent writers
//! in different processes still store each attempt once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{RunStore, SaveOutcome, StoreError, StoreResult, not_found};
use crate::types::{ModelRecord, VerificationRun};

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub url: String,
    /// Prefix for the `<prefix>_runs` and `<prefix>_model_snapshots` tables.
    pub table_prefix: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table_prefix: "llm_verifier".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }
}

fn storage_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable {
            message: e.to_string(),
        },
        other => StoreError::storage(other.to_string()),
    }
}

#[derive(Debug)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    runs_table: String,
    snapshots_table: String,
}

impl PostgresStore {
    /// Connect and create tables if missing.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(storage_err)?;
        let store = Self::with_pool(Arc::new(pool), &config.table_prefix);
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_pool(pool: Arc<PgPool>, table_prefix: &str) -> Self {
        Self {
            pool,
            runs_table: format!("{table_prefix}_runs"),
            snapshots_table: format!("{table_prefix}_model_snapshots"),
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {runs} (
                    provider VARCHAR(255) NOT NULL,
                    model VARCHAR(255) NOT NULL,
                    attempt_at TIMESTAMPTZ NOT NULL,
                    run_id UUID NOT NULL,
                    score DOUBLE PRECISION NOT NULL,
                    supported BOOLEAN NOT NULL,
                    status VARCHAR(32) NOT NULL,
                    data JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (provider, model, attempt_at)
                )
                "#,
                runs = self.runs_table
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{runs}_run_id ON {runs} (run_id)",
                runs = self.runs_table
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {snaps} (
                    provider VARCHAR(255) NOT NULL,
                    model VARCHAR(255) NOT NULL,
                    discovered_at TIMESTAMPTZ NOT NULL,
                    data JSONB NOT NULL,
                    PRIMARY KEY (provider, model, discovered_at)
                )
                "#,
                snaps = self.snapshots_table
            ),
        ];
        for statement in statements {
            sqlx::query(&statement)
                .execute(&*self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    fn decode_runs(rows: Vec<sqlx::postgres::PgRow>) -> StoreResult<Vec<VerificationRun>> {
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.get("data");
                serde_json::from_value(data).map_err(StoreError::Serialization)
            })
            .collect()
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn save(&self, run: &VerificationRun) -> StoreResult<SaveOutcome> {
        let data = serde_json::to_value(run)?;
        let query = format!(
            r#"
            INSERT INTO {} (provider, model, attempt_at, run_id, score, supported, status, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (provider, model, attempt_at) DO NOTHING
            "#,
            self.runs_table
        );

        let result = sqlx::query(&query)
            .bind(&run.provider)
            .bind(&run.model)
            .bind(run.attempt_at)
            .bind(run.run_id)
            .bind(run.score)
            .bind(run.supported)
            .bind(run.status.as_str())
            .bind(&data)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(if result.rows_affected() > 0 {
            SaveOutcome::Inserted
        } else {
            SaveOutcome::AlreadyStored
        })
    }

    async fn history_page(
        &self,
        provider: &str,
        model: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<VerificationRun>> {
        let query = format!(
            "SELECT data FROM {} WHERE provider = $1 AND model = $2 \
             ORDER BY attempt_at ASC LIMIT $3 OFFSET $4",
            self.runs_table
        );
        let rows = sqlx::query(&query)
            .bind(provider)
            .bind(model)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;
        Self::decode_runs(rows)
    }

    async fn history_after(
        &self,
        provider: &str,
        model: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<VerificationRun>> {
        let query = format!(
            "SELECT data FROM {} WHERE provider = $1 AND model = $2 \
             AND ($3::timestamptz IS NULL OR attempt_at > $3) \
             ORDER BY attempt_at ASC LIMIT $4",
            self.runs_table
        );
        let rows = sqlx::query(&query)
            .bind(provider)
            .bind(model)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;
        Self::decode_runs(rows)
    }

    async fn latest(&self, provider: &str, model: &str) -> StoreResult<VerificationRun> {
        let query = format!(
            "SELECT data FROM {} WHERE provider = $1 AND model = $2 \
             ORDER BY attempt_at DESC LIMIT 1",
            self.runs_table
        );
        let rows = sqlx::query(&query)
            .bind(provider)
            .bind(model)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;
        Self::decode_runs(rows)?
            .pop()
            .ok_or_else(|| not_found(provider, model))
    }

    async fn append_snapshot(&self, record: &ModelRecord) -> StoreResult<()> {
        let data = serde_json::to_value(record)?;
        let query = format!(
            "INSERT INTO {} (provider, model, discovered_at, data) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (provider, model, discovered_at) DO NOTHING",
            self.snapshots_table
        );
        sqlx::query(&query)
            .bind(&record.provider)
            .bind(&record.model_id)
            .bind(record.discovered_at)
            .bind(&data)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn snapshots(&self, provider: &str, model: &str) -> StoreResult<Vec<ModelRecord>> {
        let query = format!(
            "SELECT data FROM {} WHERE provider = $1 AND model = $2 ORDER BY discovered_at ASC",
            self.snapshots_table
        );
        let rows = sqlx::query(&query)
            .bind(provider)
            .bind(model)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.get("data");
                serde_json::from_value(data).map_err(StoreError::Serialization)
            })
            .collect()
    }
}
