//! Ingestion loop: sample, persist, prune
//!
//! Each cycle walks `Idle -> Sampling -> Persisting -> Pruning -> Idle`.
//! A failed step ends the cycle early and the next tick starts fresh:
//! - sampling failure: nothing is written
//! - persistence failure: pruning is skipped
//! - pruning failure: the row stays written, the next cycle catches up
//!
//! Cycles run inline in the timer loop, so two cycles never overlap; ticks
//! missed while a cycle runs are skipped rather than queued.

use crate::config::AgentConfig;
use crate::discovery::{HostIdentity, HostLabel};
use crate::error::{CycleError, StartupError, StoreError};
use crate::metrics::{MetricSample, MetricSampler};
use crate::probe::OsProbe;
use crate::retention::RetentionPolicy;
use crate::store::PerformanceStore;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Where the current cycle is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Sampling,
    Persisting,
    Pruning,
}

/// Counters over the lifetime of the loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub completed: u64,
    pub sampling_failures: u64,
    pub persistence_failures: u64,
    pub retention_failures: u64,
    pub timeouts: u64,
    pub rows_inserted: u64,
    pub rows_pruned: u64,
}

/// Result of a cycle that reached the end
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub row_id: i64,
    pub pruned: u64,
    pub sample: MetricSample,
}

pub struct IngestionLoop {
    sampler: MetricSampler,
    store: Arc<dyn PerformanceStore>,
    policy: RetentionPolicy,
    period: Duration,
    state: CycleState,
    stats: LoopStats,
}

impl IngestionLoop {
    pub fn new(
        sampler: MetricSampler,
        store: Arc<dyn PerformanceStore>,
        policy: RetentionPolicy,
        period: Duration,
    ) -> Self {
        Self {
            sampler,
            store,
            policy,
            period,
            state: CycleState::Idle,
            stats: LoopStats::default(),
        }
    }

    /// Build the sampler for an already resolved identity and sync the label;
    /// nothing is sampled yet
    pub async fn bootstrap(
        config: &AgentConfig,
        identity: HostIdentity,
        probe: Arc<dyn OsProbe>,
        store: Arc<dyn PerformanceStore>,
    ) -> Result<Self, StartupError> {
        let label = config.label();
        let policy = config.retention_policy()?;

        let sampler = MetricSampler::new(probe, identity, label.clone())
            .with_cpu_window(config.cpu_window());
        let ingestion = Self::new(sampler, store, policy, config.interval());

        if let Some(label) = &label {
            if let Err(e) = ingestion.sync_label(label).await {
                warn!(
                    system_id = ingestion.host_identity().short(),
                    error = %e,
                    "Failed to update stored label, continuing"
                );
            }
        }

        Ok(ingestion)
    }

    pub fn host_identity(&self) -> &HostIdentity {
        self.sampler.host_identity()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Rewrite the stored label when it differs from `label`; returns rows changed
    pub async fn sync_label(&self, label: &HostLabel) -> Result<u64, StoreError> {
        let host = self.host_identity();
        let stored = self.store.stored_label(host).await?;
        if stored.as_deref() == Some(label.as_str()) {
            debug!(system_id = host.short(), "Stored label already up to date");
            return Ok(0);
        }

        let changed = self.store.update_label(host, label).await?;
        match stored {
            Some(previous) => info!(
                system_id = host.short(),
                from = %previous,
                to = label.as_str(),
                rows = changed,
                "Updated stored server name"
            ),
            None => debug!(
                system_id = host.short(),
                rows = changed,
                "No stored server name yet, new rows will carry the label"
            ),
        }
        Ok(changed)
    }

    /// Run exactly one cycle, bounded by the tick period
    pub async fn tick(&mut self) -> Result<CycleReport, CycleError> {
        self.stats.cycles += 1;
        let budget = self.period;

        let result = match timeout(budget, self.run_cycle()).await {
            Ok(result) => result,
            Err(_) => Err(CycleError::Timeout(budget)),
        };
        let interrupted = self.state;
        self.state = CycleState::Idle;

        let system_id = self.host_identity().short().to_string();
        match &result {
            Ok(report) => {
                self.stats.completed += 1;
                debug!(
                    system_id = %system_id,
                    row_id = report.row_id,
                    pruned = report.pruned,
                    "Performance metrics captured and stored"
                );
            }
            Err(CycleError::Sampling(e)) => {
                self.stats.sampling_failures += 1;
                warn!(system_id = %system_id, metric = e.metric(), error = %e, "Sampling failed, cycle skipped");
            }
            Err(CycleError::Persistence(e)) => {
                self.stats.persistence_failures += 1;
                error!(system_id = %system_id, error = %e, "Failed to store sample, pruning skipped");
            }
            Err(CycleError::Retention(e)) => {
                self.stats.retention_failures += 1;
                warn!(system_id = %system_id, error = %e, "Retention enforcement failed, will retry next cycle");
            }
            Err(CycleError::Timeout(budget)) => {
                self.stats.timeouts += 1;
                warn!(system_id = %system_id, state = ?interrupted, budget = ?budget, "Cycle abandoned after exceeding its budget");
            }
        }

        result
    }

    async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.state = CycleState::Sampling;
        let sample = self.sampler.sample().await?;

        self.state = CycleState::Persisting;
        let row_id = self
            .store
            .insert_sample(&sample)
            .await
            .map_err(CycleError::Persistence)?;
        self.stats.rows_inserted += 1;

        self.state = CycleState::Pruning;
        let pruned = self
            .policy
            .enforce(self.store.as_ref(), self.sampler.host_identity())
            .await?;
        self.stats.rows_pruned += pruned;

        Ok(CycleReport {
            row_id,
            pruned,
            sample,
        })
    }

    /// Tick every period until `shutdown` resolves
    ///
    /// Shutdown is honoured between cycles and also abandons a running cycle.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            system_id = %self.host_identity(),
            period = ?self.period,
            window = %self.policy.window(),
            strategy = ?self.policy.strategy(),
            "Starting ingestion loop"
        );

        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = timer.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!(state = ?self.state, "Shutdown requested, abandoning current cycle");
                            break;
                        }
                        // failures are logged and counted inside tick()
                        _ = self.tick() => {}
                    }
                }
            }
        }

        self.state = CycleState::Idle;
        info!(stats = ?self.stats, "Ingestion loop stopped");
    }
}
