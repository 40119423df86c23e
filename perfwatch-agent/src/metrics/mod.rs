//! System metrics sampling for the perfwatch agent
//!
//! Provides the four measurements stored per cycle:
//! - CPU usage, from the delta of two idle/total snapshots taken a short window apart
//! - Memory usage of the whole system
//! - Disk usage of the root filesystem
//! - Cumulative received/transmitted megabytes of the primary IPv4 interface
//!
//! A sample is all-or-nothing: the first failing measurement aborts `sample()`.

use crate::discovery::{HostIdentity, HostLabel};
use crate::error::SamplingError;
use crate::probe::{CoreTimes, InterfaceInfo, MemoryTotals, OsProbe};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bytes per megabyte used for the network counters
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// Default distance between the two CPU snapshots
pub const DEFAULT_CPU_WINDOW: Duration = Duration::from_millis(100);

/// One complete observation of the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub host_identity: HostIdentity,
    pub host_label: Option<HostLabel>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Cumulative since the interface came up, not a per-cycle delta
    pub network_in_mb: f64,
    pub network_out_mb: f64,
    pub captured_at: DateTime<Utc>,
}

/// Idle and total CPU time averaged over all logical cores at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuWindow {
    pub idle: f64,
    pub total: f64,
}

impl CpuWindow {
    pub fn from_cores(cores: &[CoreTimes]) -> Result<Self, SamplingError> {
        if cores.is_empty() {
            return Err(SamplingError::CpuRead("no logical cores reported".into()));
        }

        let (idle, total) = cores.iter().fold((0u64, 0u64), |(idle, total), core| {
            (idle + core.idle, total + core.total())
        });
        let count = cores.len() as f64;

        Ok(Self {
            idle: idle as f64 / count,
            total: total as f64 / count,
        })
    }

    /// Utilization over the interval between `earlier` and `self`
    pub fn utilization_since(&self, earlier: &CpuWindow) -> Result<f64, SamplingError> {
        cpu_utilization(self.idle - earlier.idle, self.total - earlier.total)
    }
}

/// `100 - floor(100 * idle_delta / total_delta)`, clamped into `[0, 100]`
///
/// A zero (or negative) total delta means the counters did not move and
/// yields `CpuTiming` instead of a NaN/Infinity percentage.
pub fn cpu_utilization(idle_delta: f64, total_delta: f64) -> Result<f64, SamplingError> {
    let timing_error = || SamplingError::CpuTiming {
        idle_delta,
        total_delta,
    };

    if !(total_delta > 0.0) || !idle_delta.is_finite() || !total_delta.is_finite() {
        return Err(timing_error());
    }

    let percent = 100.0 - (100.0 * idle_delta / total_delta).floor();
    if !percent.is_finite() {
        return Err(timing_error());
    }
    Ok(percent.clamp(0.0, 100.0))
}

/// `(total - free) / total * 100`
pub fn memory_percent(totals: &MemoryTotals) -> Result<f64, SamplingError> {
    if totals.total_bytes == 0 {
        return Err(SamplingError::MemoryRead("total memory reported as 0".into()));
    }
    let used = totals.total_bytes.saturating_sub(totals.free_bytes);
    Ok(used as f64 / totals.total_bytes as f64 * 100.0)
}

/// First non-loopback interface carrying an IPv4 address, by enumeration order
pub fn select_network_interface(interfaces: &[InterfaceInfo]) -> Option<&InterfaceInfo> {
    interfaces.iter().find(|i| i.has_ipv4 && !i.is_loopback)
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Clears the in-flight flag when the blocking call returns or is dropped
struct ProbeSlot(Arc<AtomicBool>);

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Produces MetricSamples for one host
///
/// At most one blocking probe call is in flight. A call abandoned by a
/// cycle timeout keeps its slot until the OS returns, and later calls fail
/// fast instead of queueing more workers behind it.
pub struct MetricSampler {
    probe: Arc<dyn OsProbe>,
    host_identity: HostIdentity,
    host_label: Option<HostLabel>,
    cpu_window: Duration,
    probe_busy: Arc<AtomicBool>,
}

impl MetricSampler {
    pub fn new(
        probe: Arc<dyn OsProbe>,
        host_identity: HostIdentity,
        host_label: Option<HostLabel>,
    ) -> Self {
        Self {
            probe,
            host_identity,
            host_label,
            cpu_window: DEFAULT_CPU_WINDOW,
            probe_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    pub fn host_identity(&self) -> &HostIdentity {
        &self.host_identity
    }

    /// True while a blocking probe call has not returned yet
    pub fn probe_in_flight(&self) -> bool {
        self.probe_busy.load(Ordering::Acquire)
    }

    /// Collect every metric; any failure discards the partial sample
    pub async fn sample(&self) -> Result<MetricSample, SamplingError> {
        debug!("Collecting system metrics...");

        let cpu_percent = self.cpu_usage().await?;
        let memory_percent = self.memory_usage().await?;
        let disk_percent = self.disk_usage().await?;
        let (network_in_mb, network_out_mb) = self.network_usage().await?;

        Ok(MetricSample {
            host_identity: self.host_identity.clone(),
            host_label: self.host_label.clone(),
            cpu_percent,
            memory_percent,
            disk_percent,
            network_in_mb,
            network_out_mb,
            captured_at: Utc::now(),
        })
    }

    /// Two snapshots `cpu_window` apart; the wait yields to the runtime
    pub async fn cpu_usage(&self) -> Result<f64, SamplingError> {
        let start = self.with_probe(|p| CpuWindow::from_cores(&p.cpu_times()?)).await?;
        tokio::time::sleep(self.cpu_window).await;
        let end = self.with_probe(|p| CpuWindow::from_cores(&p.cpu_times()?)).await?;

        end.utilization_since(&start)
    }

    pub async fn memory_usage(&self) -> Result<f64, SamplingError> {
        self.with_probe(|p| memory_percent(&p.memory()?)).await
    }

    pub async fn disk_usage(&self) -> Result<f64, SamplingError> {
        let percent = self.with_probe(|p| p.root_disk_usage()).await?;
        if !(0.0..=100.0).contains(&percent) {
            return Err(SamplingError::DiskRead(format!(
                "usage {} outside 0..=100",
                percent
            )));
        }
        Ok(percent)
    }

    /// Cumulative (in, out) megabytes of the selected interface
    pub async fn network_usage(&self) -> Result<(f64, f64), SamplingError> {
        self.with_probe(|p| {
            let interfaces = p.interfaces().map_err(|e| SamplingError::NetworkRead {
                interface: "*".into(),
                reason: e.to_string(),
            })?;
            let interface = select_network_interface(&interfaces)
                .ok_or(SamplingError::NetworkInterfaceNotFound)?;
            let counters = p.interface_counters(&interface.name)?;

            Ok((bytes_to_mb(counters.rx_bytes), bytes_to_mb(counters.tx_bytes)))
        })
        .await
    }

    /// Run a blocking probe call on the blocking pool
    async fn with_probe<T, F>(&self, f: F) -> Result<T, SamplingError>
    where
        F: FnOnce(&dyn OsProbe) -> Result<T, SamplingError> + Send + 'static,
        T: Send + 'static,
    {
        if self.probe_busy.swap(true, Ordering::AcqRel) {
            return Err(SamplingError::Worker(
                "previous probe call still running".into(),
            ));
        }
        let slot = ProbeSlot(Arc::clone(&self.probe_busy));

        let probe = Arc::clone(&self.probe);
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            f(probe.as_ref())
        })
            .await
            .map_err(|e| SamplingError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::InterfaceCounters;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct FakeProbe {
        cpu: Mutex<VecDeque<Vec<CoreTimes>>>,
        disk: Result<f64, String>,
        interfaces: Vec<InterfaceInfo>,
    }

    impl OsProbe for FakeProbe {
        fn cpu_times(&self) -> Result<Vec<CoreTimes>, SamplingError> {
            self.cpu
                .lock()
                .pop_front()
                .ok_or_else(|| SamplingError::CpuRead("script exhausted".into()))
        }
        fn memory(&self) -> Result<MemoryTotals, SamplingError> {
            Ok(MemoryTotals {
                total_bytes: 8 * 1024,
                free_bytes: 2 * 1024,
            })
        }
        fn root_disk_usage(&self) -> Result<f64, SamplingError> {
            self.disk.clone().map_err(SamplingError::DiskRead)
        }
        fn interfaces(&self) -> std::io::Result<Vec<InterfaceInfo>> {
            Ok(self.interfaces.clone())
        }
        fn interface_counters(&self, name: &str) -> Result<InterfaceCounters, SamplingError> {
            assert_eq!(name, "eth0");
            Ok(InterfaceCounters {
                rx_bytes: 3 * 1_048_576,
                tx_bytes: 1_048_576 / 2,
            })
        }
    }

    fn core(idle: u64, busy: u64) -> CoreTimes {
        CoreTimes {
            user: busy,
            idle,
            ..Default::default()
        }
    }

    fn iface(name: &str, loopback: bool, ipv4: bool) -> InterfaceInfo {
        InterfaceInfo {
            name: name.into(),
            mac: Some([2, 0, 0, 0, 0, 1]),
            is_loopback: loopback,
            has_ipv4: ipv4,
        }
    }

    fn sampler(cpu: Vec<Vec<CoreTimes>>, disk: Result<f64, String>) -> MetricSampler {
        let probe = FakeProbe {
            cpu: Mutex::new(cpu.into()),
            disk,
            interfaces: vec![iface("lo", true, true), iface("eth0", false, true)],
        };
        MetricSampler::new(
            Arc::new(probe),
            HostIdentity::from_token("host-a"),
            HostLabel::parse("web-01"),
        )
        .with_cpu_window(Duration::from_millis(1))
    }

    #[test]
    fn test_cpu_utilization_matches_formula() {
        for total in 1..=200u32 {
            for idle in 0..=total {
                let (idle, total) = (idle as f64, total as f64);
                let pct = cpu_utilization(idle, total).unwrap();
                assert_eq!(pct, 100.0 - (100.0 * idle / total).floor());
                assert!((0.0..=100.0).contains(&pct));
            }
        }
    }

    #[test]
    fn test_cpu_utilization_zero_total_is_timing_error() {
        assert!(matches!(cpu_utilization(0.0, 0.0), Err(SamplingError::CpuTiming { .. })));
        assert!(matches!(cpu_utilization(5.0, 0.0), Err(SamplingError::CpuTiming { .. })));
        assert!(matches!(cpu_utilization(1.0, -3.0), Err(SamplingError::CpuTiming { .. })));
        assert!(matches!(cpu_utilization(f64::NAN, 10.0), Err(SamplingError::CpuTiming { .. })));
    }

    #[test]
    fn test_cpu_utilization_clamps_pathological_windows() {
        // idle grew faster than total
        assert_eq!(cpu_utilization(150.0, 100.0).unwrap(), 0.0);
        // idle went backwards
        assert_eq!(cpu_utilization(-20.0, 100.0).unwrap(), 100.0);
    }

    #[test]
    fn test_cpu_window_averages_cores() {
        let window = CpuWindow::from_cores(&[core(100, 100), core(300, 100)]).unwrap();
        assert_eq!(window.idle, 200.0);
        assert_eq!(window.total, 300.0);
        assert!(CpuWindow::from_cores(&[]).is_err());
    }

    #[test]
    fn test_memory_percent() {
        let totals = MemoryTotals {
            total_bytes: 1000,
            free_bytes: 250,
        };
        assert_eq!(memory_percent(&totals).unwrap(), 75.0);
        assert!(memory_percent(&MemoryTotals {
            total_bytes: 0,
            free_bytes: 0
        })
        .is_err());
    }

    #[test]
    fn test_select_network_interface_is_name_order() {
        let interfaces = vec![
            iface("lo", true, true),
            iface("docker0", false, false),
            iface("eth1", false, true),
            iface("eth0", false, true),
        ];
        assert_eq!(select_network_interface(&interfaces).unwrap().name, "eth1");
        assert!(select_network_interface(&interfaces[..2]).is_none());
    }

    #[tokio::test]
    async fn test_sample_collects_all_metrics() {
        // idle delta 60, total delta 100 per core => 100 - 60 = 40%
        let sampler = sampler(
            vec![
                vec![core(1000, 1000), core(1000, 1000)],
                vec![core(1060, 1040), core(1060, 1040)],
            ],
            Ok(42.0),
        );

        let sample = sampler.sample().await.unwrap();
        assert_eq!(sample.cpu_percent, 40.0);
        assert_eq!(sample.memory_percent, 75.0);
        assert_eq!(sample.disk_percent, 42.0);
        assert_eq!(sample.network_in_mb, 3.0);
        assert_eq!(sample.network_out_mb, 0.5);
        assert_eq!(sample.host_identity.as_str(), "host-a");
        assert_eq!(sample.host_label.as_ref().unwrap().as_str(), "web-01");
    }

    #[tokio::test]
    async fn test_sample_fails_on_stalled_cpu_counters() {
        let snapshot = vec![core(500, 500)];
        let sampler = sampler(vec![snapshot.clone(), snapshot], Ok(10.0));

        let err = sampler.sample().await.unwrap_err();
        assert!(matches!(err, SamplingError::CpuTiming { .. }));
        assert_eq!(err.metric(), "cpu");
    }

    /// Disk reads block until `release` is set
    #[derive(Default)]
    struct StuckDiskProbe {
        release: AtomicBool,
        disk_calls: std::sync::atomic::AtomicUsize,
    }

    impl OsProbe for StuckDiskProbe {
        fn cpu_times(&self) -> Result<Vec<CoreTimes>, SamplingError> {
            Ok(vec![core(0, 0)])
        }
        fn memory(&self) -> Result<MemoryTotals, SamplingError> {
            Ok(MemoryTotals {
                total_bytes: 100,
                free_bytes: 50,
            })
        }
        fn root_disk_usage(&self) -> Result<f64, SamplingError> {
            self.disk_calls.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(12.0)
        }
        fn interfaces(&self) -> std::io::Result<Vec<InterfaceInfo>> {
            Ok(vec![iface("eth0", false, true)])
        }
        fn interface_counters(&self, _name: &str) -> Result<InterfaceCounters, SamplingError> {
            Ok(InterfaceCounters::default())
        }
    }

    #[tokio::test]
    async fn test_stuck_probe_call_is_not_stacked() {
        let probe = Arc::new(StuckDiskProbe::default());
        let sampler = MetricSampler::new(probe.clone(), HostIdentity::from_token("host-a"), None);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), sampler.disk_usage()).await;
        assert!(abandoned.is_err());
        assert!(sampler.probe_in_flight());

        for _ in 0..5 {
            let err = sampler.disk_usage().await.unwrap_err();
            assert!(matches!(err, SamplingError::Worker(_)));
            assert_eq!(err.metric(), "probe");
        }
        assert_eq!(probe.disk_calls.load(Ordering::SeqCst), 1);

        probe.release.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), async {
            while sampler.probe_in_flight() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sampler.disk_usage().await.unwrap(), 12.0);
        assert_eq!(probe.disk_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sample_fails_on_disk_error() {
        let sampler = sampler(
            vec![vec![core(0, 0)], vec![core(50, 50)]],
            Err("permission denied".into()),
        );

        assert!(matches!(sampler.sample().await, Err(SamplingError::DiskRead(_))));
    }
}
