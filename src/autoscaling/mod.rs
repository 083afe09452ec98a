//! Autoscaled cooperative task pool
//!
//! The pool is the scheduler's only throttle: it probes task readiness,
//! launches tasks while below the desired concurrency, and dials that
//! desired level up and down against CPU and memory pressure.

pub mod pool;
pub mod system_status;

pub use pool::{AutoscaledPool, AutoscaledPoolConfig, PoolError, PoolHooks};
pub use system_status::{
    LoadAverageSystemInfo, NoopSystemInfo, SystemInfoSource, SystemSnapshot, SystemStatusTracker,
};
