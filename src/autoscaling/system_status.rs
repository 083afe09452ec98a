//! Host load sampling
//!
//! The pool decides scale-down purely from a window of boolean
//! overload samples. Samples come from a synchronous
//! [`SystemInfoSource`] and, when an event bus is attached, from the
//! host's `CpuInfo` events.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// One load observation
#[derive(Debug, Clone, Copy)]
pub struct SystemSnapshot {
    pub cpu_overloaded: bool,
    pub memory_overloaded: bool,
    pub timestamp: DateTime<Utc>,
}

impl SystemSnapshot {
    /// Either signal counts as overloaded for scaling purposes
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.cpu_overloaded || self.memory_overloaded
    }
}

/// Synchronous host-load probe
pub trait SystemInfoSource: Send + Sync {
    fn sample(&self) -> SystemSnapshot;
}

/// Source that never reports overload
///
/// Useful in tests and on hosts where load probing is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSystemInfo;

impl SystemInfoSource for NoopSystemInfo {
    fn sample(&self) -> SystemSnapshot {
        SystemSnapshot {
            cpu_overloaded: false,
            memory_overloaded: false,
            timestamp: Utc::now(),
        }
    }
}

/// Linux load probe reading `/proc/loadavg` and `/proc/meminfo`
///
/// CPU counts as overloaded when the 1-minute load average exceeds
/// `cpu_load_ratio * num_cpus`; memory when the available fraction drops
/// below `min_free_memory_ratio`. On hosts without procfs both signals
/// read as not overloaded.
#[derive(Debug, Clone, Copy)]
pub struct LoadAverageSystemInfo {
    pub cpu_load_ratio: f64,
    pub min_free_memory_ratio: f64,
}

impl Default for LoadAverageSystemInfo {
    fn default() -> Self {
        Self {
            cpu_load_ratio: 0.95,
            min_free_memory_ratio: 0.15,
        }
    }
}

impl LoadAverageSystemInfo {
    fn cpu_overloaded(&self) -> bool {
        let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") else {
            return false;
        };
        let Some(load1) = loadavg
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        else {
            return false;
        };
        load1 > self.cpu_load_ratio * num_cpus::get() as f64
    }

    fn memory_overloaded(&self) -> bool {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return false;
        };
        let mut total_kb = None;
        let mut available_kb = None;
        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total_kb = parts.next().and_then(|v| v.parse::<u64>().ok()),
                Some("MemAvailable:") => {
                    available_kb = parts.next().and_then(|v| v.parse::<u64>().ok());
                }
                _ => {}
            }
        }
        match (total_kb, available_kb) {
            (Some(total), Some(available)) if total > 0 => {
                (available as f64 / total as f64) < self.min_free_memory_ratio
            }
            _ => false,
        }
    }
}

impl SystemInfoSource for LoadAverageSystemInfo {
    fn sample(&self) -> SystemSnapshot {
        SystemSnapshot {
            cpu_overloaded: self.cpu_overloaded(),
            memory_overloaded: self.memory_overloaded(),
            timestamp: Utc::now(),
        }
    }
}

/// Ring buffer of recent snapshots
#[derive(Debug)]
pub struct SystemStatusTracker {
    samples: VecDeque<SystemSnapshot>,
    capacity: usize,
}

impl SystemStatusTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push a sample, evicting the oldest at capacity
    pub fn push(&mut self, snapshot: SystemSnapshot) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(snapshot);
    }

    /// Fraction of buffered samples that were overloaded
    #[must_use]
    pub fn overloaded_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let overloaded = self.samples.iter().filter(|s| s.is_overloaded()).count();
        overloaded as f64 / self.samples.len() as f64
    }

    /// The newest sample, if any
    #[must_use]
    pub fn latest(&self) -> Option<&SystemSnapshot> {
        self.samples.back()
    }

    /// Forget the window, starting a fresh scaling interval
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
