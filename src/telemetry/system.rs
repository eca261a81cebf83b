//! Process-level metrics sampling with bounded history.
//!
//! Snapshots come from `/proc` on Linux (CPU jiffy deltas from
//! `/proc/self/stat`, resident memory and thread count from
//! `/proc/self/status`, total memory from `/proc/meminfo`); other platforms
//! report zeros. The collector only hands snapshots out — it never calls into
//! the performance monitor, which keeps the dependency one-directional.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of samples retained per history series.
pub const HISTORY_CAPACITY: usize = 100;

/// One point-in-time process snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub thread_count: usize,
}

/// Derived statistics over one bounded history series.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStats {
    pub data: Vec<f64>,
    pub average: f64,
    pub max: f64,
    pub min: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalMetrics {
    pub cpu: SeriesStats,
    pub memory: SeriesStats,
    pub data_points: usize,
    pub capacity: usize,
}

struct CollectorState {
    interval: Duration,
    cpu_history: VecDeque<f64>,
    memory_history: VecDeque<f64>,
    // (sampled_at, utime+stime jiffies) for CPU% deltas
    last_cpu_sample: Option<(Instant, u64)>,
    total_memory_bytes: u64,
}

pub struct SystemMetricsCollector {
    state: RwLock<CollectorState>,
}

impl Default for SystemMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsCollector {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CollectorState {
                interval: Duration::from_secs(30),
                cpu_history: VecDeque::with_capacity(HISTORY_CAPACITY),
                memory_history: VecDeque::with_capacity(HISTORY_CAPACITY),
                last_cpu_sample: None,
                total_memory_bytes: read_total_memory_bytes(),
            }),
        }
    }

    /// Take a snapshot and append it to the bounded histories.
    pub fn collect(&self) -> SystemSnapshot {
        let (memory_bytes, thread_count) = read_process_status();
        let cpu_jiffies = read_process_jiffies();
        let now = Instant::now();

        let mut state = self.state.write().unwrap();

        let cpu_percent = match (state.last_cpu_sample, cpu_jiffies) {
            (Some((prev_at, prev_jiffies)), Some(jiffies)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    let ticks_per_sec = 100.0; // USER_HZ on every mainstream Linux
                    let used = jiffies.saturating_sub(prev_jiffies) as f64 / ticks_per_sec;
                    (used / elapsed * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        if let Some(jiffies) = cpu_jiffies {
            state.last_cpu_sample = Some((now, jiffies));
        }

        let memory_percent = if state.total_memory_bytes > 0 {
            (memory_bytes as f64 / state.total_memory_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        push_bounded(&mut state.cpu_history, cpu_percent);
        push_bounded(&mut state.memory_history, memory_bytes as f64);

        let snapshot = SystemSnapshot {
            timestamp: Utc::now(),
            cpu_percent,
            memory_bytes,
            memory_percent,
            thread_count,
        };

        debug!(
            cpu = format!("{:.1}%", snapshot.cpu_percent),
            memory_mb = snapshot.memory_bytes / (1024 * 1024),
            threads = snapshot.thread_count,
            "system metrics collected"
        );

        snapshot
    }

    /// Historical CPU/memory series with derived avg/max/min.
    pub fn historical(&self) -> HistoricalMetrics {
        let state = self.state.read().unwrap();
        let cpu = series_stats(&state.cpu_history);
        let memory = series_stats(&state.memory_history);
        let data_points = state.cpu_history.len();

        HistoricalMetrics {
            cpu,
            memory,
            data_points,
            capacity: HISTORY_CAPACITY,
        }
    }

    pub fn interval(&self) -> Duration {
        self.state.read().unwrap().interval
    }

    pub fn set_interval(&self, interval: Duration) {
        self.state.write().unwrap().interval = interval;
    }

    pub fn clear_history(&self) {
        let mut state = self.state.write().unwrap();
        state.cpu_history.clear();
        state.memory_history.clear();
    }
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64) {
    if history.len() >= HISTORY_CAPACITY {
        history.pop_front();
    }
    history.push_back(value);
}

fn series_stats(history: &VecDeque<f64>) -> SeriesStats {
    let data: Vec<f64> = history.iter().copied().collect();
    if data.is_empty() {
        return SeriesStats {
            data,
            average: 0.0,
            max: 0.0,
            min: 0.0,
        };
    }

    let sum: f64 = data.iter().sum();
    let max = data.iter().copied().fold(f64::MIN, f64::max);
    let min = data.iter().copied().fold(f64::MAX, f64::min);

    SeriesStats {
        average: sum / data.len() as f64,
        max,
        min,
        data,
    }
}

/// Resident memory bytes and thread count from `/proc/self/status`.
fn read_process_status() -> (u64, usize) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let mut vm_rss = 0u64;
            let mut threads = 0usize;
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next() {
                        vm_rss = kb.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if let Some(rest) = line.strip_prefix("Threads:") {
                    threads = rest.trim().parse::<usize>().unwrap_or(0);
                }
            }
            return (vm_rss, threads);
        }
    }
    (0, 0)
}

/// Combined user+system jiffies from `/proc/self/stat`.
#[cfg(target_os = "linux")]
fn read_process_jiffies() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 (utime) and 15 (stime), counted after the parenthesised
    // command name which may itself contain spaces
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_process_jiffies() -> Option<u64> {
    None
}

fn read_total_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    if let Some(kb) = rest.split_whitespace().next() {
                        return kb.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_stays_bounded() {
        let collector = SystemMetricsCollector::new();

        for _ in 0..(HISTORY_CAPACITY + 20) {
            collector.collect();
        }

        let history = collector.historical();
        assert_eq!(history.data_points, HISTORY_CAPACITY);
        assert_eq!(history.cpu.data.len(), HISTORY_CAPACITY);
        assert_eq!(history.memory.data.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_series_stats_derivation() {
        let mut series = VecDeque::new();
        series.extend([10.0, 20.0, 30.0]);

        let stats = series_stats(&series);
        assert!((stats.average - 20.0).abs() < f64::EPSILON);
        assert!((stats.max - 30.0).abs() < f64::EPSILON);
        assert!((stats.min - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_series_is_zeroed() {
        let stats = series_stats(&VecDeque::new());
        assert_eq!(stats.average, 0.0);
        assert_eq!(stats.max, 0.0);
        assert_eq!(stats.min, 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshot_reads_process_values() {
        let collector = SystemMetricsCollector::new();
        let snapshot = collector.collect();

        assert!(snapshot.thread_count >= 1);
        assert!(snapshot.memory_bytes > 0);
        assert!(snapshot.cpu_percent >= 0.0 && snapshot.cpu_percent <= 100.0);
    }

    #[test]
    fn test_clear_history() {
        let collector = SystemMetricsCollector::new();
        collector.collect();
        collector.collect();
        assert!(collector.historical().data_points > 0);

        collector.clear_history();
        assert_eq!(collector.historical().data_points, 0);
    }
}
