//! PostgreSQL store over a small sqlx pool

use super::{as_sql_count, PerformanceStore, StoredSample};
use crate::config::StoreConfig;
use crate::discovery::{HostIdentity, HostLabel};
use crate::error::StoreResult;
use crate::metrics::MetricSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS server_performance (
        id BIGSERIAL PRIMARY KEY,
        system_id TEXT NOT NULL,
        server_name TEXT,
        cpu_usage DOUBLE PRECISION NOT NULL,
        memory_usage DOUBLE PRECISION NOT NULL,
        disk_usage DOUBLE PRECISION NOT NULL,
        network_in DOUBLE PRECISION NOT NULL,
        network_out DOUBLE PRECISION NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS server_performance_system_id_timestamp_idx
    ON server_performance (system_id, timestamp DESC)
"#;

/// `PerformanceStore` backed by the `server_performance` table
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, config: &StoreConfig) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        info!("Connected to the database");
        Ok(Self { pool })
    }

    /// Create the table and its (system_id, timestamp) index when missing
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        debug!("server_performance schema ready");
        Ok(())
    }
}

#[async_trait]
impl PerformanceStore for PgStore {
    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO server_performance
                (system_id, server_name, cpu_usage, memory_usage, disk_usage,
                 network_in, network_out, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id::BIGINT
            "#,
        )
        .bind(sample.host_identity.as_str())
        .bind(sample.host_label.as_ref().map(|l| l.as_str()))
        .bind(sample.cpu_percent)
        .bind(sample.memory_percent)
        .bind(sample.disk_percent)
        .bind(sample.network_in_mb)
        .bind(sample.network_out_mb)
        .bind(sample.captured_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn count_samples(&self, system_id: &HostIdentity) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM server_performance WHERE system_id = $1")
                .bind(system_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn prune_ranked(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM server_performance
            WHERE system_id = $1
              AND id IN (
                SELECT id FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (ORDER BY timestamp DESC, id DESC) AS rank
                    FROM server_performance
                    WHERE system_id = $1
                ) ranked
                WHERE ranked.rank > $2
              )
            "#,
        )
        .bind(system_id.as_str())
        .bind(as_sql_count(keep))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn trim_oldest(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        // serialises trims of the same host across agents until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(system_id.as_str())
            .execute(&mut *tx)
            .await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM server_performance WHERE system_id = $1")
                .bind(system_id.as_str())
                .fetch_one(&mut *tx)
                .await?;

        let excess = count - as_sql_count(keep);
        if excess <= 0 {
            tx.commit().await?;
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            DELETE FROM server_performance
            WHERE id IN (
                SELECT id FROM server_performance
                WHERE system_id = $1
                ORDER BY timestamp ASC, id ASC
                LIMIT $2
            )
            "#,
        )
        .bind(system_id.as_str())
        .bind(excess)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn stored_label(&self, system_id: &HostIdentity) -> StoreResult<Option<String>> {
        let label: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT server_name FROM server_performance
            WHERE system_id = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(system_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(label.flatten())
    }

    async fn update_label(
        &self,
        system_id: &HostIdentity,
        label: &HostLabel,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE server_performance
            SET server_name = $2
            WHERE system_id = $1 AND server_name IS DISTINCT FROM $2
            "#,
        )
        .bind(system_id.as_str())
        .bind(label.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn recent_samples(
        &self,
        system_id: &HostIdentity,
        limit: u64,
    ) -> StoreResult<Vec<StoredSample>> {
        let rows = sqlx::query(
            r#"
            SELECT id::BIGINT AS id, system_id, server_name,
                   cpu_usage::FLOAT8 AS cpu_usage, memory_usage::FLOAT8 AS memory_usage,
                   disk_usage::FLOAT8 AS disk_usage, network_in::FLOAT8 AS network_in,
                   network_out::FLOAT8 AS network_out, timestamp::TIMESTAMPTZ AS timestamp
            FROM server_performance
            WHERE system_id = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(system_id.as_str())
        .bind(as_sql_count(limit))
        .fetch_all(&self.pool)
        .await?;

        let samples = rows
            .into_iter()
            .map(|row| StoredSample {
                id: row.get::<i64, _>("id"),
                system_id: row.get::<String, _>("system_id"),
                server_name: row.get::<Option<String>, _>("server_name"),
                cpu_usage: row.get::<f64, _>("cpu_usage"),
                memory_usage: row.get::<f64, _>("memory_usage"),
                disk_usage: row.get::<f64, _>("disk_usage"),
                network_in: row.get::<f64, _>("network_in"),
                network_out: row.get::<f64, _>("network_out"),
                timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
            })
            .collect();

        Ok(samples)
    }
}
