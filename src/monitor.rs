//! Process memory sampling for worker attribution.
//!
//! Advisory telemetry only: samples feed
//! [`WorkerManager::monitor_memory_usage`](crate::WorkerManager::monitor_memory_usage),
//! which callers can use for external backpressure. The engine never rejects
//! work based on these numbers.

/// Sample the current process's resident set size, in MB.
///
/// Reads `VmRSS` from `/proc/self/status` on Linux. On platforms without
/// procfs (or if the read fails) this returns 0.0, which still satisfies the
/// "defined, non-negative" contract for worker attribution.
pub fn sample_rss_mb() -> f64 {
    read_vm_rss_kb().map_or(0.0, |kb| kb as f64 / 1024.0)
}

#[cfg(target_os = "linux")]
fn read_vm_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_kb(&status)
}

#[cfg(not(target_os = "linux"))]
fn read_vm_rss_kb() -> Option<u64> {
    None
}

/// Parse the `VmRSS` line out of a `/proc/<pid>/status` dump.
#[allow(dead_code)] // unused on non-Linux targets
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Split a total sample evenly across `count` workers.
///
/// Returns 0.0 for an empty pool rather than dividing by zero.
pub fn per_worker_share(total_mb: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        (total_mb / count as f64).max(0.0)
    }
}
