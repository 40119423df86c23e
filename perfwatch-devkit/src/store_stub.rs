/*!
Store en mémoire avec injection de pannes

Délègue à `MemoryStore` et fait échouer à la demande la prochaine
insertion ou le prochain élagage, pour tester l'isolation des cycles.
*/

use async_trait::async_trait;
use perfwatch_agent::error::StoreResult;
use perfwatch_agent::store::{MemoryStore, PerformanceStore, StoredSample};
use perfwatch_agent::{HostIdentity, HostLabel, MetricSample, StoreError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Wraps a `MemoryStore`; armed failures are consumed one per call
#[derive(Default)]
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    insert_failures: AtomicU32,
    prune_failures: AtomicU32,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the rows behind the wrapper
    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    pub fn fail_next_inserts(&self, count: u32) {
        self.insert_failures.fetch_add(count, Ordering::SeqCst);
    }

    pub fn fail_next_prunes(&self, count: u32) {
        self.prune_failures.fetch_add(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PerformanceStore for FaultyStore {
    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<i64> {
        if Self::take(&self.insert_failures) {
            return Err(StoreError::Unavailable("injected insert failure".into()));
        }
        self.inner.insert_sample(sample).await
    }

    async fn count_samples(&self, system_id: &HostIdentity) -> StoreResult<u64> {
        self.inner.count_samples(system_id).await
    }

    async fn prune_ranked(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64> {
        if Self::take(&self.prune_failures) {
            return Err(StoreError::Unavailable("injected prune failure".into()));
        }
        self.inner.prune_ranked(system_id, keep).await
    }

    async fn trim_oldest(&self, system_id: &HostIdentity, keep: u64) -> StoreResult<u64> {
        if Self::take(&self.prune_failures) {
            return Err(StoreError::Unavailable("injected prune failure".into()));
        }
        self.inner.trim_oldest(system_id, keep).await
    }

    async fn stored_label(&self, system_id: &HostIdentity) -> StoreResult<Option<String>> {
        self.inner.stored_label(system_id).await
    }

    async fn update_label(
        &self,
        system_id: &HostIdentity,
        label: &HostLabel,
    ) -> StoreResult<u64> {
        self.inner.update_label(system_id, label).await
    }

    async fn recent_samples(
        &self,
        system_id: &HostIdentity,
        limit: u64,
    ) -> StoreResult<Vec<StoredSample>> {
        self.inner.recent_samples(system_id, limit).await
    }
}
