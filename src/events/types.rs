//! Event type definitions for the scheduler event system

use serde::{Deserialize, Serialize};

/// Events published on the scheduler bus
///
/// The core only ever consumes these; producing them is the job of the
/// bus itself (`PersistState` ticks) or of the embedding host
/// (`Migrating`, `CpuInfo`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    /// Periodic request to persist component state
    ///
    /// Emitted on a fixed interval and once more, with `is_migrating`
    /// set, when a migration is underway.
    PersistState {
        is_migrating: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// The host may terminate and restart this process elsewhere soon
    Migrating {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// CPU load sample from the host
    CpuInfo {
        is_cpu_overloaded: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Signals that the bus is shutting down
    ///
    /// Subscribers should exit their event loops when receiving this.
    Shutdown {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl SchedulerEvent {
    /// Create a `PersistState` event
    #[must_use]
    pub fn persist_state(is_migrating: bool) -> Self {
        Self::PersistState {
            is_migrating,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a `Migrating` event
    #[must_use]
    pub fn migrating() -> Self {
        Self::Migrating {
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a `CpuInfo` event
    #[must_use]
    pub fn cpu_info(is_cpu_overloaded: bool) -> Self {
        Self::CpuInfo {
            is_cpu_overloaded,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a `Shutdown` event
    #[must_use]
    pub fn shutdown() -> Self {
        Self::Shutdown {
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Consistent view of the bus counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventBusMetricsSnapshot {
    /// Events handed to the broadcast channel
    pub events_published: u64,
    /// Events published while no subscriber was listening
    pub events_dropped: u64,
    /// Subscribers at snapshot time
    pub active_subscribers: usize,
}
