//! Memory probing for utilization-based pool sizing.
//!
//! candle exposes no free-memory query on its backends, so the budget is
//! taken from host memory: exact on CPU, the natural bound on unified
//! architectures, and a conservative stand-in for discrete GPUs. When no
//! probe exists for the platform the caller must size the pool
//! explicitly.

use candle_core::Device;

/// Snapshot of host memory at probe time.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Bytes available for allocation on `device`, or `None` when the
/// platform offers no probe.
pub fn available_device_bytes(device: &Device) -> Option<u64> {
    let _ = device;
    host_memory().map(|stats| stats.available_bytes)
}

/// Host memory statistics.
#[cfg(target_os = "linux")]
pub fn host_memory() -> Option<MemoryStats> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

#[cfg(not(target_os = "linux"))]
pub fn host_memory() -> Option<MemoryStats> {
    None
}

#[allow(dead_code)]
fn parse_meminfo(raw: &str) -> Option<MemoryStats> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(rest);
        }
    }
    Some(MemoryStats {
        total_bytes: total_kb? * 1024,
        available_bytes: available_kb? * 1024,
    })
}

#[allow(dead_code)]
fn parse_kb(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}
