//! Scheduler event system
//!
//! Publishes lifecycle signals consumed by the crawler, session pool and
//! statistics: periodic `PersistState` ticks, external `Migrating`
//! notifications and `CpuInfo` samples.

pub mod bus;
pub mod errors;
pub mod types;

pub use bus::EventBus;
pub use errors::EventBusError;
pub use types::{EventBusMetricsSnapshot, SchedulerEvent};
