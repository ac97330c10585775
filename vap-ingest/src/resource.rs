//! Resource monitoring and adaptive sizing
//!
//! Two coarse admission-control decisions, each sampled once per run rather
//! than continuously: how many parallel workers to admit, and whether a
//! given file should be read in streaming mode.

use std::thread;
use std::time::Duration;
use sysinfo::System;
use vap_common::config::WorkerCount;

/// Point-in-time memory snapshot
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub total_mb: f64,
    pub available_mb: f64,
    pub used_percent: f64,
}

impl MemorySample {
    /// Sample current system memory via sysinfo.
    pub fn current() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory() as f64 / (1024.0 * 1024.0);
        let available = sys.available_memory() as f64 / (1024.0 * 1024.0);
        let used_percent = if total > 0.0 {
            (1.0 - available / total) * 100.0
        } else {
            0.0
        };
        Self {
            total_mb: total,
            available_mb: available,
            used_percent,
        }
    }
}

/// Choose the worker-pool size for this run.
///
/// Starts from the configured count (or logical CPUs - 1 for auto), caps at
/// the file count, and scales down by `reduce_factor` (floored at
/// `min_workers`) when the sampled disk-busy percentage is at/above the
/// threshold. Never returns less than 1.
pub fn choose_worker_count(
    file_count: usize,
    configured: &WorkerCount,
    disk_busy_percent: Option<f64>,
    busy_threshold: f64,
    reduce_factor: f64,
    min_workers: usize,
) -> usize {
    let mut target = match configured.fixed() {
        Some(n) => n.max(1),
        None => std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1),
    };

    if file_count > 0 {
        target = target.min(file_count);
    }

    if let Some(busy) = disk_busy_percent {
        if busy >= busy_threshold {
            let reduced = ((target as f64) * reduce_factor) as usize;
            target = reduced.max(min_workers.max(1));
        }
    }

    target.max(1)
}

/// Decide whether one file should be read in streaming mode.
///
/// Stream when the file exceeds the large-file threshold, when system memory
/// usage is already at/above the switch threshold, or when the file exceeds
/// the configured fraction of currently available memory.
pub fn should_stream(
    file_size_bytes: u64,
    large_file_streaming_mb: f64,
    stream_switch_threshold_percent: f64,
    available_memory_fraction: f64,
    memory: &MemorySample,
) -> bool {
    let file_size_mb = file_size_bytes as f64 / (1024.0 * 1024.0);

    if file_size_mb > large_file_streaming_mb {
        return true;
    }
    if memory.used_percent >= stream_switch_threshold_percent {
        return true;
    }
    if file_size_mb > memory.available_mb * available_memory_fraction {
        return true;
    }
    false
}

/// Rows per streaming chunk, sized from available memory and clamped to a
/// sane range; falls back to the static configuration value.
pub fn dynamic_stream_chunk_size(memory: &MemorySample, memory_fraction: f64) -> usize {
    let rows = (memory.available_mb * memory_fraction * 1024.0) as usize;
    rows.clamp(5_000, 100_000)
}

/// Sample system-wide disk busy percentage over a short window.
///
/// Reads io_ticks from /proc/diskstats twice; returns `None` on platforms
/// without that interface or when the read fails, in which case the caller
/// skips IO throttling.
pub fn measure_disk_busy_percent(sample_ms: u64) -> Option<f64> {
    let before = read_io_ticks_ms()?;
    thread::sleep(Duration::from_millis(sample_ms));
    let after = read_io_ticks_ms()?;

    let delta_ms = after.saturating_sub(before) as f64;
    let busy = (delta_ms / sample_ms as f64) * 100.0;
    Some(busy.clamp(0.0, 100.0))
}

/// Total milliseconds spent doing I/O, summed over physical block devices.
#[cfg(target_os = "linux")]
fn read_io_ticks_ms() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/diskstats").ok()?;
    let mut total = 0u64;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // name major minor reads ... ; io_ticks is the 13th stat field
        if fields.len() < 13 {
            continue;
        }
        let name = fields[2];
        // Skip partitions and virtual devices; whole disks only
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") {
            continue;
        }
        if name.ends_with(|c: char| c.is_ascii_digit()) && !name.starts_with("nvme") {
            continue;
        }
        if name.starts_with("nvme") && name.contains('p') {
            continue;
        }
        if let Ok(ticks) = fields[12].parse::<u64>() {
            total = total.saturating_add(ticks);
        }
    }
    Some(total)
}

#[cfg(not(target_os = "linux"))]
fn read_io_ticks_ms() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(available_mb: f64, used_percent: f64) -> MemorySample {
        MemorySample {
            total_mb: 16_384.0,
            available_mb,
            used_percent,
        }
    }

    #[test]
    fn worker_count_caps_at_file_count() {
        let n = choose_worker_count(2, &WorkerCount::Fixed(8), None, 75.0, 0.5, 1);
        assert_eq!(n, 2);
    }

    #[test]
    fn worker_count_reduces_when_disk_busy() {
        let idle = choose_worker_count(100, &WorkerCount::Fixed(8), Some(10.0), 75.0, 0.5, 1);
        let busy = choose_worker_count(100, &WorkerCount::Fixed(8), Some(90.0), 75.0, 0.5, 1);
        assert_eq!(idle, 8);
        assert_eq!(busy, 4);
        // Monotonicity: a busy sample never yields more workers than an idle one
        assert!(busy <= idle);
    }

    #[test]
    fn worker_count_floors_at_min_workers() {
        let n = choose_worker_count(100, &WorkerCount::Fixed(2), Some(99.0), 75.0, 0.1, 2);
        assert_eq!(n, 2);
    }

    #[test]
    fn worker_count_never_below_one() {
        let n = choose_worker_count(1, &WorkerCount::Fixed(1), Some(100.0), 75.0, 0.0, 0);
        assert_eq!(n, 1);
    }

    #[test]
    fn auto_worker_count_is_positive() {
        let n = choose_worker_count(100, &WorkerCount::default(), None, 75.0, 0.5, 1);
        assert!(n >= 1);
    }

    #[test]
    fn stream_on_large_file() {
        let mem = sample(8_000.0, 30.0);
        assert!(should_stream(200 * 1024 * 1024, 100.0, 75.0, 0.4, &mem));
        assert!(!should_stream(10 * 1024 * 1024, 100.0, 75.0, 0.4, &mem));
    }

    #[test]
    fn stream_on_memory_pressure() {
        let mem = sample(1_000.0, 80.0);
        assert!(should_stream(1024, 100.0, 75.0, 0.4, &mem));
    }

    #[test]
    fn stream_on_available_memory_fraction() {
        // 50MB file, only 100MB available, fraction 0.4 -> 40MB budget
        let mem = sample(100.0, 30.0);
        assert!(should_stream(50 * 1024 * 1024, 100.0, 75.0, 0.4, &mem));
    }

    #[test]
    fn dynamic_chunk_size_is_clamped() {
        assert_eq!(dynamic_stream_chunk_size(&sample(1.0, 0.0), 0.1), 5_000);
        assert_eq!(
            dynamic_stream_chunk_size(&sample(1_000_000.0, 0.0), 0.1),
            100_000
        );
    }
}
