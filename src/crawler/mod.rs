//! Crawlers
//!
//! [`BasicCrawler`] binds a request source, the autoscaled pool, an
//! optional session pool and statistics around user-supplied request
//! logic. [`BrowserCrawler`] layers a per-request page lifecycle on top.

pub mod basic;
pub mod browser;
pub mod errors;

pub use basic::{
    BasicCrawler, BasicCrawlerConfig, BoxHandlerFuture, CrawlingContext, FailedRequestHandler,
    RequestHandler,
};
pub use browser::{BrowserCrawler, BrowserCrawlerConfig, NavigationHook};
pub use errors::{CrawlError, HandlerOutcome};

use std::time::Duration;

/// Bound on the drain wait when a migration is announced
pub const SAFE_MIGRATION_WAIT: Duration = Duration::from_secs(20);

/// Interval of the event bus's `PersistState` ticks during a run
pub const PERSIST_STATE_INTERVAL: Duration = Duration::from_secs(60);
