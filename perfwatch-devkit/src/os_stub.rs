/*!
Sonde OS scriptée

Remplace `SystemProbe` dans les tests: chaque lecture renvoie une valeur
fixée à l'avance, et des pannes ponctuelles peuvent être programmées.
*/

use parking_lot::Mutex;
use perfwatch_agent::probe::{CoreTimes, InterfaceCounters, InterfaceInfo, MemoryTotals, OsProbe};
use perfwatch_agent::SamplingError;
use std::collections::{HashMap, VecDeque};

/// Default advance of the cumulative counters per CPU read: 50 idle out of 100
const DEFAULT_STEP: (u64, u64) = (50, 100);

struct CpuScript {
    /// Cumulative (idle, total) snapshots still to be served
    queued: VecDeque<(u64, u64)>,
    last: (u64, u64),
}

/// Mock OS that serves scripted readings
pub struct ScriptedProbe {
    cpu: Mutex<CpuScript>,
    memory: Mutex<MemoryTotals>,
    disk: Mutex<f64>,
    disk_failures: Mutex<VecDeque<String>>,
    interfaces: Mutex<Vec<InterfaceInfo>>,
    counters: Mutex<HashMap<String, InterfaceCounters>>,
}

impl ScriptedProbe {
    /// One ethernet interface `eth0` plus loopback, 50% CPU, 75% memory, 40% disk
    pub fn new() -> Self {
        Self {
            cpu: Mutex::new(CpuScript {
                queued: VecDeque::new(),
                last: (0, 0),
            }),
            memory: Mutex::new(MemoryTotals {
                total_bytes: 8 * 1024 * 1024 * 1024,
                free_bytes: 2 * 1024 * 1024 * 1024,
            }),
            disk: Mutex::new(40.0),
            disk_failures: Mutex::new(VecDeque::new()),
            interfaces: Mutex::new(vec![
                Self::interface("lo", None, true, true),
                Self::interface("eth0", Some([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]), false, true),
            ]),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn interface(
        name: &str,
        mac: Option<[u8; 6]>,
        is_loopback: bool,
        has_ipv4: bool,
    ) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            mac,
            is_loopback,
            has_ipv4,
        }
    }

    /// Queue cumulative (idle, total) snapshots, served one per CPU read
    pub fn script_cpu(&self, snapshots: &[(u64, u64)]) {
        self.cpu.lock().queued.extend(snapshots.iter().copied());
    }

    /// Queue one sampling window with the given deltas, continuing from the last snapshot
    pub fn script_cpu_window(&self, idle_delta: u64, total_delta: u64) {
        let mut cpu = self.cpu.lock();
        let base = cpu.queued.back().copied().unwrap_or(cpu.last);
        cpu.queued.push_back(base);
        cpu.queued
            .push_back((base.0 + idle_delta, base.1 + total_delta));
    }

    pub fn set_memory(&self, total_bytes: u64, free_bytes: u64) {
        *self.memory.lock() = MemoryTotals {
            total_bytes,
            free_bytes,
        };
    }

    pub fn set_disk(&self, percent: f64) {
        *self.disk.lock() = percent;
    }

    /// Next root filesystem read fails with `reason`
    pub fn fail_disk_once(&self, reason: &str) {
        self.disk_failures.lock().push_back(reason.to_string());
    }

    pub fn set_interfaces(&self, interfaces: Vec<InterfaceInfo>) {
        *self.interfaces.lock() = interfaces;
    }

    pub fn set_counters(&self, name: &str, rx_bytes: u64, tx_bytes: u64) {
        self.counters
            .lock()
            .insert(name.to_string(), InterfaceCounters { rx_bytes, tx_bytes });
    }
}

impl Default for ScriptedProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProbe for ScriptedProbe {
    fn cpu_times(&self) -> Result<Vec<CoreTimes>, SamplingError> {
        let mut cpu = self.cpu.lock();
        let (idle, total) = match cpu.queued.pop_front() {
            Some(snapshot) => snapshot,
            None => (cpu.last.0 + DEFAULT_STEP.0, cpu.last.1 + DEFAULT_STEP.1),
        };
        cpu.last = (idle, total);

        Ok(vec![CoreTimes {
            idle,
            user: total.saturating_sub(idle),
            ..Default::default()
        }])
    }

    fn memory(&self) -> Result<MemoryTotals, SamplingError> {
        Ok(*self.memory.lock())
    }

    fn root_disk_usage(&self) -> Result<f64, SamplingError> {
        if let Some(reason) = self.disk_failures.lock().pop_front() {
            return Err(SamplingError::DiskRead(reason));
        }
        Ok(*self.disk.lock())
    }

    fn interfaces(&self) -> std::io::Result<Vec<InterfaceInfo>> {
        Ok(self.interfaces.lock().clone())
    }

    fn interface_counters(&self, name: &str) -> Result<InterfaceCounters, SamplingError> {
        Ok(self.counters.lock().get(name).copied().unwrap_or_default())
    }
}
