//! Process-level setup: worker pool, logging and memory readings.

use std::sync::Once;

use rayon::ThreadPoolBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variables consulted for the worker count, most specific first.
const THREAD_HINTS: [&str; 6] = [
    "DISAGG_THREADS",
    "RAYON_NUM_THREADS",
    "SLURM_CPUS_PER_TASK",
    "SLURM_CPUS_ON_NODE",
    "PBS_NP",
    "OMP_NUM_THREADS",
];

/// Worker count and the hint it came from.
fn worker_threads() -> (usize, &'static str) {
    THREAD_HINTS
        .iter()
        .find_map(|&var| {
            let n = std::env::var(var).ok()?.trim().parse::<usize>().ok()?;
            (n > 0).then_some((n, var))
        })
        .unwrap_or_else(|| {
            let n = std::thread::available_parallelism().map_or(1, |n| n.get());
            (n, "available_parallelism")
        })
}

/// Configure the global rayon pool once; later calls are no-ops.
pub fn configure_thread_pool() {
    static POOL: Once = Once::new();
    POOL.call_once(|| {
        let (threads, hint) = worker_threads();
        let built = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("disagg-worker-{i}"))
            .build_global();
        match built {
            Ok(()) => info!(threads, hint, "worker pool configured"),
            // another pool was installed first, e.g. by the embedding service
            Err(err) => warn!(%err, "keeping the existing rayon pool"),
        }
    });
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; only the first call wins.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

// memory readings

pub const KB: u64 = 1024;
pub const MB: u64 = KB * 1024;
pub const GB: u64 = MB * 1024;

fn parse_budget_var(lookup: &impl Fn(&str) -> Option<String>, var: &str, unit: u64) -> Option<u64> {
    let amount: u64 = lookup(var)?.trim().parse().ok()?;
    Some(amount.saturating_mul(unit))
}

/// Operator override for the memory the pre-flight check may assume, read
/// through `lookup` (normally the process environment).
pub fn memory_override_bytes(lookup: &impl Fn(&str) -> Option<String>) -> Option<u64> {
    parse_budget_var(lookup, "DISAGG_AVAILABLE_MEMORY_BYTES", 1)
        .or_else(|| parse_budget_var(lookup, "DISAGG_AVAILABLE_MEMORY_MB", MB))
        .or_else(|| parse_budget_var(lookup, "DISAGG_AVAILABLE_MEMORY_GB", GB))
}

fn page_size() -> Option<u64> {
    let bytes = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    (bytes > 0).then_some(bytes as u64)
}

fn meminfo_available(contents: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib.saturating_mul(KB))
    })
}

/// Memory currently available to new allocations, as reported by the kernel.
pub fn available_memory_bytes() -> Option<u64> {
    if let Some(bytes) = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| meminfo_available(&s))
    {
        return Some(bytes);
    }
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if pages <= 0 {
        return None;
    }
    Some((pages as u64).saturating_mul(page_size()?))
}

/// Resident set size of this process, from `/proc/self/statm`.
pub fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident.saturating_mul(page_size()?))
}

pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / GB as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_line_is_parsed_in_kib() {
        let sample = "MemTotal:       16314112 kB\nMemFree:         1022452 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(meminfo_available(sample), Some(8_000_000 * KB));
        assert_eq!(meminfo_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn logging_init_is_idempotent() {
        init_logging();
        init_logging();
        configure_thread_pool();
        assert!(rayon::current_num_threads() >= 1);
    }

    #[test]
    fn gib_conversion() {
        assert!((bytes_to_gib(3 * GB) - 3.0).abs() < 1e-12);
    }
}
