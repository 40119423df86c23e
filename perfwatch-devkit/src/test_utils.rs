/*!
Test Harness pour la boucle d'ingestion

Facilite l'écriture de tests de bout en bout avec:
- Sonde OS scriptée et store instrumenté préconfigurés
- Démarrage identique à celui du binaire (identité, label, rétention)
- Pilotage manuel des ticks, sans horloge murale
*/

use crate::os_stub::ScriptedProbe;
use crate::store_stub::FaultyStore;
use anyhow::Result;
use perfwatch_agent::store::{PerformanceStore, StoredSample, MEMORY_STORE_URL};
use perfwatch_agent::{
    AgentConfig, CycleError, CycleReport, HostIdentity, IdentityResolver, IngestionLoop,
    RetentionStrategy,
};
use std::sync::Arc;
use tracing::info;

/// Harness de test: sonde + store + boucle d'ingestion
pub struct TestHarness {
    pub probe: Arc<ScriptedProbe>,
    pub store: Arc<FaultyStore>,
    pub config: AgentConfig,
}

impl TestHarness {
    /// Window of `max_samples`, 1 ms CPU window, no label
    pub fn new(max_samples: u64) -> Self {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("perfwatch_agent=debug")
            .try_init()
            .ok();

        let mut config = AgentConfig::default();
        config.store.database_url = Some(MEMORY_STORE_URL.to_string());
        config.agent.cpu_sample_ms = 1;
        config.retention.max_samples = max_samples;

        Self {
            probe: Arc::new(ScriptedProbe::new()),
            store: Arc::new(FaultyStore::new()),
            config,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.config.agent.label = Some(label.to_string());
        self
    }

    pub fn with_strategy(mut self, strategy: RetentionStrategy) -> Self {
        self.config.retention.strategy = strategy;
        self
    }

    /// Identity the scripted interfaces resolve to
    pub fn identity(&self) -> Result<HostIdentity> {
        Ok(IdentityResolver::new(self.probe.as_ref()).resolve()?)
    }

    /// Same startup sequence as the binary, minus the real OS and database
    pub async fn start(&self) -> Result<IngestionLoop> {
        self.config.validate()?;
        let identity = self.identity()?;
        let ingestion = IngestionLoop::bootstrap(
            &self.config,
            identity,
            self.probe.clone(),
            self.store.clone(),
        )
        .await?;

        info!("Harness started for {}", ingestion.host_identity().short());
        Ok(ingestion)
    }

    /// Drive `count` cycles back to back
    pub async fn run_ticks(
        ingestion: &mut IngestionLoop,
        count: usize,
    ) -> Vec<Result<CycleReport, CycleError>> {
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(ingestion.tick().await);
        }
        results
    }

    /// Rows of `host`, newest first
    pub async fn rows_for(&self, host: &HostIdentity) -> Result<Vec<StoredSample>> {
        Ok(self.store.recent_samples(host, u64::MAX).await?)
    }
}
