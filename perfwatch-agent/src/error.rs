//! Error taxonomy for the agent
//!
//! Only `StartupError` is fatal. Everything raised during a cycle is
//! wrapped in `CycleError` and ends that cycle without touching the loop.

use thiserror::Error;

/// Failures that prevent the agent from starting at all
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no non-loopback interface with a hardware address was found")]
    NoInterfaceFound,
    #[error("failed to enumerate network interfaces: {0}")]
    InterfaceEnumeration(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to the store: {0}")]
    StoreConnect(#[source] StoreError),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no database connection string configured (set PERFWATCH_DATABASE_URL or store.database_url)")]
    MissingDatabaseUrl,
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// A metric could not be measured; the whole cycle is skipped
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("cpu window elapsed no time (idle delta {idle_delta}, total delta {total_delta})")]
    CpuTiming { idle_delta: f64, total_delta: f64 },
    #[error("failed to read cpu times: {0}")]
    CpuRead(String),
    #[error("failed to read memory totals: {0}")]
    MemoryRead(String),
    #[error("failed to read root filesystem usage: {0}")]
    DiskRead(String),
    #[error("no active non-loopback IPv4 interface found")]
    NetworkInterfaceNotFound,
    #[error("failed to read counters for interface {interface}: {reason}")]
    NetworkRead { interface: String, reason: String },
    #[error("probe worker failed: {0}")]
    Worker(String),
}

impl SamplingError {
    /// Name of the metric that failed, for log fields
    pub fn metric(&self) -> &'static str {
        match self {
            Self::CpuTiming { .. } | Self::CpuRead(_) => "cpu",
            Self::MemoryRead(_) => "memory",
            Self::DiskRead(_) => "disk",
            Self::NetworkInterfaceNotFound | Self::NetworkRead { .. } => "network",
            Self::Worker(_) => "probe",
        }
    }
}

/// Store collaborator failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Retention enforcement failures (never fatal)
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("retention window must keep at least one sample")]
    InvalidWindow,
    #[error("prune failed: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a cycle that did not complete
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),
    #[error("persisting sample failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("retention enforcement failed: {0}")]
    Retention(#[from] RetentionError),
    #[error("cycle exceeded its {0:?} budget")]
    Timeout(std::time::Duration),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
