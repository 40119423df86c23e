//! OS collaborator: raw counters read from the host
//!
//! `OsProbe` is the seam between the sampling algorithms and the operating
//! system. `SystemProbe` reads a Linux host; tests substitute a scripted
//! probe so every algorithm can run against fixed readings.

use crate::error::SamplingError;
use if_addrs::{get_if_addrs, IfAddr};
use parking_lot::Mutex;
use sysinfo::{Networks, System};
use tracing::debug;

/// Cumulative time a single logical core spent in each state since boot (clock ticks)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CoreTimes {
    /// Sum of every state. Guest time is already folded into `user` by the kernel.
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

/// Whole-system memory totals in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTotals {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One network interface as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: Option<[u8; 6]>,
    pub is_loopback: bool,
    pub has_ipv4: bool,
}

/// Cumulative byte counters of one interface since it came up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Host facilities the sampler and the identity resolver depend on
///
/// Calls are blocking; async callers run them on a blocking worker.
pub trait OsProbe: Send + Sync {
    /// Per logical core cumulative times, in stable core order
    fn cpu_times(&self) -> Result<Vec<CoreTimes>, SamplingError>;

    fn memory(&self) -> Result<MemoryTotals, SamplingError>;

    /// Utilization percent of the filesystem mounted at `/`
    fn root_disk_usage(&self) -> Result<f64, SamplingError>;

    /// Interfaces in OS enumeration order, one entry per interface name
    fn interfaces(&self) -> std::io::Result<Vec<InterfaceInfo>>;

    fn interface_counters(&self, name: &str) -> Result<InterfaceCounters, SamplingError>;
}

/// Linux implementation backed by procfs, sysinfo, statvfs and getifaddrs
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProbe for SystemProbe {
    fn cpu_times(&self) -> Result<Vec<CoreTimes>, SamplingError> {
        let content = std::fs::read_to_string("/proc/stat")
            .map_err(|e| SamplingError::CpuRead(format!("/proc/stat: {}", e)))?;
        parse_proc_stat(&content)
    }

    fn memory(&self) -> Result<MemoryTotals, SamplingError> {
        let mut sys = self.system.lock();
        sys.refresh_memory();

        let totals = MemoryTotals {
            total_bytes: sys.total_memory(),
            free_bytes: sys.free_memory(),
        };
        if totals.total_bytes == 0 {
            return Err(SamplingError::MemoryRead("total memory reported as 0".into()));
        }
        Ok(totals)
    }

    fn root_disk_usage(&self) -> Result<f64, SamplingError> {
        let stat = nix::sys::statvfs::statvfs("/")
            .map_err(|e| SamplingError::DiskRead(format!("statvfs(/): {}", e)))?;

        df_percent(
            stat.blocks() as u64,
            stat.blocks_free() as u64,
            stat.blocks_available() as u64,
        )
        .ok_or_else(|| SamplingError::DiskRead("root filesystem reports no blocks".into()))
    }

    fn interfaces(&self) -> std::io::Result<Vec<InterfaceInfo>> {
        let addrs = get_if_addrs()?;

        let entries = addrs
            .iter()
            .map(|a| (a.name.clone(), a.is_loopback(), matches!(a.addr, IfAddr::V4(_))));

        let mut interfaces = group_by_name(entries);
        for interface in &mut interfaces {
            interface.mac = match mac_address::mac_address_by_name(&interface.name) {
                Ok(Some(mac)) => Some(mac.bytes()),
                Ok(None) => None,
                Err(e) => {
                    debug!("Error getting MAC for {}: {}", interface.name, e);
                    None
                }
            };
        }
        Ok(interfaces)
    }

    fn interface_counters(&self, name: &str) -> Result<InterfaceCounters, SamplingError> {
        let networks = Networks::new_with_refreshed_list();

        for (interface_name, data) in &networks {
            if interface_name == name {
                return Ok(InterfaceCounters {
                    rx_bytes: data.total_received(),
                    tx_bytes: data.total_transmitted(),
                });
            }
        }

        Err(SamplingError::NetworkRead {
            interface: name.to_string(),
            reason: "interface missing from kernel statistics".into(),
        })
    }
}

/// Parse the per-core `cpuN` lines of `/proc/stat`, skipping the aggregate `cpu` line
pub fn parse_proc_stat(content: &str) -> Result<Vec<CoreTimes>, SamplingError> {
    let mut cores = Vec::new();

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let is_core = label
            .strip_prefix("cpu")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_core {
            continue;
        }

        let values = fields
            .take(8)
            .map(|v| v.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SamplingError::CpuRead(format!("{}: {}", label, e)))?;
        if values.len() < 4 {
            return Err(SamplingError::CpuRead(format!("{}: too few fields", label)));
        }

        let at = |i: usize| values.get(i).copied().unwrap_or(0);
        cores.push(CoreTimes {
            user: at(0),
            nice: at(1),
            system: at(2),
            idle: at(3),
            iowait: at(4),
            irq: at(5),
            softirq: at(6),
            steal: at(7),
        });
    }

    if cores.is_empty() {
        return Err(SamplingError::CpuRead("no per-core lines in /proc/stat".into()));
    }
    Ok(cores)
}

/// Usage percent the way `df` reports it: used / (used + available), rounded up
pub fn df_percent(blocks: u64, free: u64, available: u64) -> Option<f64> {
    let used = blocks.saturating_sub(free);
    let usable = used + available;
    if usable == 0 {
        return None;
    }
    Some((used as f64 * 100.0 / usable as f64).ceil())
}

/// Collapse per-address entries into one record per interface, keeping first-seen order
pub fn group_by_name<I>(entries: I) -> Vec<InterfaceInfo>
where
    I: IntoIterator<Item = (String, bool, bool)>,
{
    let mut interfaces: Vec<InterfaceInfo> = Vec::new();

    for (name, is_loopback, is_ipv4) in entries {
        match interfaces.iter_mut().find(|i| i.name == name) {
            Some(existing) => {
                existing.is_loopback |= is_loopback;
                existing.has_ipv4 |= is_ipv4;
            }
            None => interfaces.push(InterfaceInfo {
                name,
                mac: None,
                is_loopback,
                has_ipv4: is_ipv4,
            }),
        }
    }

    interfaces
}
