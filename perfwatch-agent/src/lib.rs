//! Perfwatch agent - host performance sampling with bounded retention
//!
//! The agent identifies its host from the primary MAC address, samples
//! CPU, memory, disk and network usage on a fixed period, appends each
//! sample to `server_performance` and trims the host's rows back to the
//! configured retention window after every insert.

pub mod config;
pub mod discovery;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod probe;
pub mod retention;
pub mod store;

pub use config::AgentConfig;
pub use discovery::{HostIdentity, HostLabel, IdentityResolver};
pub use error::{CycleError, RetentionError, SamplingError, StartupError, StoreError};
pub use ingest::{CycleReport, CycleState, IngestionLoop, LoopStats};
pub use metrics::{CpuWindow, MetricSample, MetricSampler};
pub use probe::{OsProbe, SystemProbe};
pub use retention::{RetentionPolicy, RetentionStrategy, RetentionWindow};
pub use store::{MemoryStore, PerformanceStore, PgStore};
