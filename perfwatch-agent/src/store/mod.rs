//! Store collaborator for `server_performance` rows
//!
//! `PerformanceStore` is the only way the agent touches persisted data.
//! Every operation is scoped by `system_id`; nothing here reads or writes
//! another host's rows.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::config::StoreConfig;
use crate::discovery::{HostIdentity, HostLabel};
use crate::error::{StoreError, StoreResult};
use crate::metrics::MetricSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Connection string selecting the in-process store instead of PostgreSQL
pub const MEMORY_STORE_URL: &str = "memory://";

/// A persisted `server_performance` row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSample {
    pub id: i64,
    pub system_id: String,
    pub server_name: Option<String>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_in: f64,
    pub network_out: f64,
    pub timestamp: DateTime<Utc>,
}

/// Operations the agent needs from the store
///
/// Ordering for retention is `timestamp` then `id`, newest first; the id
/// tie-break keeps the order total when two rows share a timestamp.
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    /// Append one row and return its id
    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<i64>;

    async fn count_samples(&self, system_id: &HostIdentity) -> StoreResult<u64>;

    /// Delete every row of the host ranked beyond `keep`, as one atomic statement
    async fn prune_ranked(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64>;

    /// Count, then delete the oldest `count - keep` rows, inside one transaction
    async fn trim_oldest(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64>;

    /// Label carried by the newest row of the host, if any row exists
    async fn stored_label(&self, system_id: &HostIdentity) -> StoreResult<Option<String>>;

    /// Rewrite the label on the host's rows; returns rows changed
    async fn update_label(&self, system_id: &HostIdentity, label: &HostLabel)
        -> StoreResult<u64>;

    /// Newest first, at most `limit` rows
    async fn recent_samples(
        &self,
        system_id: &HostIdentity,
        limit: u64,
    ) -> StoreResult<Vec<StoredSample>>;
}

/// Open the store named by the configuration
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn PerformanceStore>> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| StoreError::Unavailable("no connection string".into()))?;

    if url == MEMORY_STORE_URL {
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = PgStore::connect(url, config).await?;
    if config.bootstrap_schema {
        store.ensure_schema().await?;
    }
    Ok(Arc::new(store))
}

/// Clamp a row count into the `i64` range SQL parameters use
pub(crate) fn as_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
