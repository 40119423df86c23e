//! Per-host retention window enforcement
//!
//! After every successful insert the host's rows are cut back to the
//! newest `max_samples`. Two strategies are available:
//! - `RankAndPrune` ranks rows newest first and deletes ranks beyond the
//!   window in one statement (default)
//! - `CountThenTrim` counts rows and deletes the oldest excess inside a
//!   single transaction

use crate::discovery::HostIdentity;
use crate::error::RetentionError;
use crate::store::PerformanceStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Maximum number of samples kept for one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct RetentionWindow(u64);

impl RetentionWindow {
    pub const DEFAULT: RetentionWindow = RetentionWindow(500);

    pub fn new(max_samples: u64) -> Result<Self, RetentionError> {
        if max_samples == 0 {
            return Err(RetentionError::InvalidWindow);
        }
        Ok(Self(max_samples))
    }

    pub fn max_samples(&self) -> u64 {
        self.0
    }

    /// Rows that have to go when the host currently has `current` rows
    pub fn excess(&self, current: u64) -> u64 {
        current.saturating_sub(self.0)
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u64> for RetentionWindow {
    type Error = RetentionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RetentionWindow> for u64 {
    fn from(window: RetentionWindow) -> Self {
        window.0
    }
}

impl fmt::Display for RetentionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} samples", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    #[default]
    RankAndPrune,
    CountThenTrim,
}

/// Decides which rows of a host are discarded after an insert
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    window: RetentionWindow,
    strategy: RetentionStrategy,
}

impl RetentionPolicy {
    pub fn new(window: RetentionWindow, strategy: RetentionStrategy) -> Self {
        Self { window, strategy }
    }

    pub fn window(&self) -> RetentionWindow {
        self.window
    }

    pub fn strategy(&self) -> RetentionStrategy {
        self.strategy
    }

    /// Delete the host's rows beyond the window; returns the number deleted
    pub async fn enforce(
        &self,
        store: &dyn PerformanceStore,
        host: &HostIdentity,
    ) -> Result<u64, RetentionError> {
        let keep = self.window.max_samples();

        let deleted = match self.strategy {
            RetentionStrategy::RankAndPrune => store.prune_ranked(host, keep).await?,
            RetentionStrategy::CountThenTrim => store.trim_oldest(host, keep).await?,
        };

        if deleted > 0 {
            info!(
                system_id = host.short(),
                deleted,
                window = keep,
                "Pruned samples beyond retention window"
            );
        } else {
            debug!(system_id = host.short(), "Retention window not exceeded");
        }
        Ok(deleted)
    }
}
