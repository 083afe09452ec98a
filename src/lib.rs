//! Crawl scheduler core
//!
//! Owns the lifecycle of large URL-processing runs: bounded, autoscaled
//! concurrency, retries with per-request bookkeeping, rotating client
//! sessions, persistence across restarts and graceful shutdown on host
//! migration. Everything that touches the outside world (browser
//! engines, HTTP transport, KV backends) enters through collaborator
//! traits.

pub mod autoscaling;
pub mod browser_pool;
pub mod crawler;
pub mod events;
pub mod request;
pub mod session;
pub mod sources;
pub mod stats;
pub mod storage;

pub use autoscaling::{
    AutoscaledPool, AutoscaledPoolConfig, LoadAverageSystemInfo, NoopSystemInfo, SystemInfoSource,
    SystemSnapshot,
};
pub use browser_pool::{
    BrowserController, BrowserDriver, BrowserError, BrowserHandle, BrowserPool, BrowserPoolConfig,
    BrowserPoolHooks, BrowserState, LaunchContext, NavigationResponse, PageHandle,
};
pub use crawler::{
    BasicCrawler, BasicCrawlerConfig, BrowserCrawler, BrowserCrawlerConfig, CrawlError,
    CrawlingContext, HandlerOutcome, SAFE_MIGRATION_WAIT,
};
pub use events::{EventBus, EventBusError, SchedulerEvent};
pub use request::{HttpMethod, Request, RetryState, compute_unique_key};
pub use session::{Session, SessionConfig, SessionPool, SessionPoolConfig};
pub use sources::{
    HttpTransport, QueueOperationInfo, RequestList, RequestListSource, RequestQueue, RequestSource,
    SourceError, SourceTandem, Transport,
};
pub use stats::{Statistics, StatisticsSnapshot, StatisticsState};
pub use storage::{KeyValueStore, MemoryKeyValueStore, StorageError};
