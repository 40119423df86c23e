//! In-process store with the same contract as the PostgreSQL one
//!
//! The whole table lives behind one mutex, so each operation observes and
//! mutates a consistent snapshot.

use super::{PerformanceStore, StoredSample};
use crate::discovery::{HostIdentity, HostLabel};
use crate::error::StoreResult;
use crate::metrics::MetricSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;

#[derive(Default)]
struct Table {
    rows: Vec<StoredSample>,
    next_id: i64,
}

impl Table {
    /// Ids of the host's rows, newest first
    fn ranked_ids(&self, system_id: &str) -> Vec<i64> {
        let mut rows: Vec<(DateTime<Utc>, i64)> = self
            .rows
            .iter()
            .filter(|r| r.system_id == system_id)
            .map(|r| (r.timestamp, r.id))
            .collect();
        rows.sort_by_key(|&key| Reverse(key));
        rows.into_iter().map(|(_, id)| id).collect()
    }

    fn delete_ranked_beyond(&mut self, system_id: &str, keep: u64) -> u64 {
        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
        let doomed: Vec<i64> = self.ranked_ids(system_id).into_iter().skip(keep).collect();
        if doomed.is_empty() {
            return 0;
        }

        let before = self.rows.len();
        self.rows
            .retain(|r| !(r.system_id == system_id && doomed.contains(&r.id)));
        (before - self.rows.len()) as u64
    }
}

/// `PerformanceStore` kept in memory
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row with an explicit timestamp and label; returns its id
    pub fn seed(
        &self,
        system_id: &HostIdentity,
        server_name: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> i64 {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.rows.push(StoredSample {
            id,
            system_id: system_id.as_str().to_string(),
            server_name: server_name.map(str::to_string),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_in: 0.0,
            network_out: 0.0,
            timestamp,
        });
        id
    }

    /// Every row, in insertion order
    pub fn rows(&self) -> Vec<StoredSample> {
        self.table.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.table.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PerformanceStore for MemoryStore {
    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<i64> {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.rows.push(StoredSample {
            id,
            system_id: sample.host_identity.as_str().to_string(),
            server_name: sample.host_label.as_ref().map(|l| l.as_str().to_string()),
            cpu_usage: sample.cpu_percent,
            memory_usage: sample.memory_percent,
            disk_usage: sample.disk_percent,
            network_in: sample.network_in_mb,
            network_out: sample.network_out_mb,
            timestamp: sample.captured_at,
        });
        Ok(id)
    }

    async fn count_samples(&self, system_id: &HostIdentity) -> StoreResult<u64> {
        let table = self.table.lock();
        Ok(table
            .rows
            .iter()
            .filter(|r| r.system_id == system_id.as_str())
            .count() as u64)
    }

    async fn prune_ranked(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64> {
        Ok(self.table.lock().delete_ranked_beyond(system_id.as_str(), keep))
    }

    async fn trim_oldest(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64> {
        let mut table = self.table.lock();
        let count = table
            .rows
            .iter()
            .filter(|r| r.system_id == system_id.as_str())
            .count() as u64;
        if count <= keep {
            return Ok(0);
        }

        // oldest first
        let mut ranked = table.ranked_ids(system_id.as_str());
        ranked.reverse();
        let doomed: Vec<i64> = ranked.into_iter().take((count - keep) as usize).collect();

        let before = table.rows.len();
        table.rows.retain(|r| !doomed.contains(&r.id));
        Ok((before - table.rows.len()) as u64)
    }

    async fn stored_label(&self, system_id: &HostIdentity) -> StoreResult<Option<String>> {
        let table = self.table.lock();
        let newest = table
            .rows
            .iter()
            .filter(|r| r.system_id == system_id.as_str())
            .max_by_key(|r| (r.timestamp, r.id));
        Ok(newest.and_then(|r| r.server_name.clone()))
    }

    async fn update_label(
        &self,
        system_id: &HostIdentity,
        label: &HostLabel,
    ) -> StoreResult<u64> {
        let mut table = self.table.lock();
        let mut changed = 0;
        for row in table
            .rows
            .iter_mut()
            .filter(|r| r.system_id == system_id.as_str())
        {
            if row.server_name.as_deref() != Some(label.as_str()) {
                row.server_name = Some(label.as_str().to_string());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn recent_samples(
        &self,
        system_id: &HostIdentity,
        limit: u64,
    ) -> StoreResult<Vec<StoredSample>> {
        let table = self.table.lock();
        let mut rows: Vec<StoredSample> = table
            .rows
            .iter()
            .filter(|r| r.system_id == system_id.as_str())
            .cloned()
            .collect();
        rows.sort_by_key(|r| Reverse((r.timestamp, r.id)));
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn host(name: &str) -> HostIdentity {
        HostIdentity::from_token(name)
    }

    #[tokio::test]
    async fn test_ranked_ids_break_timestamp_ties_by_id() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.seed(&host("a"), None, now);
        let second = store.seed(&host("a"), None, now);

        let recent = store.recent_samples(&host("a"), 10).await.unwrap();
        assert_eq!(recent[0].id, second);
        assert_eq!(recent[1].id, first);
    }

    #[tokio::test]
    async fn test_update_label_only_touches_one_host() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.seed(&host("a"), Some("A"), now);
        store.seed(&host("b"), Some("other"), now);

        let label = HostLabel::parse("B").unwrap();
        assert_eq!(store.update_label(&host("a"), &label).await.unwrap(), 1);
        assert_eq!(store.update_label(&host("a"), &label).await.unwrap(), 0);

        assert_eq!(store.stored_label(&host("a")).await.unwrap().as_deref(), Some("B"));
        assert_eq!(store.stored_label(&host("b")).await.unwrap().as_deref(), Some("other"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_stored_label_reads_newest_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.seed(&host("a"), Some("old"), now - Duration::seconds(10));
        store.seed(&host("a"), Some("new"), now);

        assert_eq!(store.stored_label(&host("a")).await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.stored_label(&host("missing")).await.unwrap(), None);
    }
}
