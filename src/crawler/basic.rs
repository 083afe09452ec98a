//! Basic crawler
//!
//! Binds a request source, the autoscaled pool, optional session pool and
//! statistics around user request logic: fetch, process, then mark
//! handled or reclaim for retry. Only two conditions abort a whole crawl:
//! a failure inside the failure-handling path itself, and a storage
//! failure while marking a request handled (the request's state would
//! otherwise be ambiguous).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::errors::{CrawlError, HandlerOutcome};
use super::{PERSIST_STATE_INTERVAL, SAFE_MIGRATION_WAIT};
use crate::autoscaling::pool::{AutoscaledPool, AutoscaledPoolConfig, BoxBoolFuture, PoolHooks};
use crate::autoscaling::system_status::SystemInfoSource;
use crate::browser_pool::{NavigationResponse, PageHandle};
use crate::events::{EventBus, SchedulerEvent};
use crate::request::Request;
use crate::session::{Session, SessionPool, SessionPoolConfig};
use crate::sources::RequestSource;
use crate::stats::Statistics;

/// Boxed future returned by user handlers
pub type BoxHandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
/// User request logic
pub type RequestHandler = Arc<dyn Fn(CrawlingContext) -> BoxHandlerFuture + Send + Sync>;
/// Invoked once per terminally failed request
pub type FailedRequestHandler =
    Arc<dyn Fn(Request, anyhow::Error) -> BoxHandlerFuture + Send + Sync>;

/// Everything a handler invocation sees
///
/// The request is shared: navigation layers set `loaded_url` on it and
/// the scheduler reads the mutations back when the invocation settles.
#[derive(Clone)]
pub struct CrawlingContext {
    pub request: Arc<parking_lot::Mutex<Request>>,
    pub session: Option<Session>,
    pub proxy_info: Option<String>,
    /// Present in browser crawls
    pub page: Option<Arc<dyn PageHandle>>,
    /// Present after navigation
    pub response: Option<NavigationResponse>,
    /// Shared scratch space; hook chains communicate through it
    pub state: Arc<parking_lot::Mutex<serde_json::Map<String, serde_json::Value>>>,
}

impl CrawlingContext {
    /// Context for a request about to be processed
    #[must_use]
    pub fn new(request: Request, session: Option<Session>) -> Self {
        Self {
            request: Arc::new(parking_lot::Mutex::new(request)),
            session,
            proxy_info: None,
            page: None,
            response: None,
            state: Arc::new(parking_lot::Mutex::new(serde_json::Map::new())),
        }
    }

    /// Snapshot of the request at this moment
    #[must_use]
    pub fn request(&self) -> Request {
        self.request.lock().clone()
    }

    /// The request's URL
    #[must_use]
    pub fn url(&self) -> String {
        self.request.lock().url.clone()
    }
}

/// Basic crawler configuration
#[derive(Debug, Clone)]
pub struct BasicCrawlerConfig {
    /// Retries after the first attempt before a request fails terminally
    pub max_request_retries: u32,
    /// Stop launching once this many requests were processed
    pub max_requests_per_crawl: Option<usize>,
    /// Deadline for one handler invocation
    pub handle_request_timeout: Duration,
    pub use_session_pool: bool,
    /// Merge response cookies back into the session after navigation
    pub persist_cookies_per_session: bool,
    /// Blocked-status failures per request before giving up on rotation
    pub max_session_rotations: u32,
    pub pool: AutoscaledPoolConfig,
}

impl Default for BasicCrawlerConfig {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            max_requests_per_crawl: None,
            handle_request_timeout: Duration::from_secs(60),
            use_session_pool: false,
            persist_cookies_per_session: false,
            max_session_rotations: 10,
            pool: AutoscaledPoolConfig::default(),
        }
    }
}

/// Scheduler core: source in, user logic per request, outcomes recorded
pub struct BasicCrawler {
    config: BasicCrawlerConfig,
    source: Arc<dyn RequestSource>,
    handler: RequestHandler,
    failed_handler: Option<FailedRequestHandler>,
    user_is_finished: Option<Arc<dyn Fn() -> BoxBoolFuture + Send + Sync>>,
    session_pool: Option<Arc<SessionPool>>,
    stats: Arc<Statistics>,
    bus: Arc<EventBus>,
    system_info: Option<Arc<dyn SystemInfoSource>>,
    /// Handled plus terminally failed requests
    processed_count: AtomicUsize,
    cap_logged: AtomicBool,
}

impl BasicCrawler {
    /// Create a crawler over `source` running `handler` per request
    #[must_use]
    pub fn new(
        source: Arc<dyn RequestSource>,
        handler: RequestHandler,
        config: BasicCrawlerConfig,
    ) -> Self {
        let session_pool = config
            .use_session_pool
            .then(|| Arc::new(SessionPool::new(SessionPoolConfig::default())));
        Self {
            config,
            source,
            handler,
            failed_handler: None,
            user_is_finished: None,
            session_pool,
            stats: Arc::new(Statistics::new(0)),
            bus: Arc::new(EventBus::new()),
            system_info: None,
            processed_count: AtomicUsize::new(0),
            cap_logged: AtomicBool::new(false),
        }
    }

    /// Invoke `handler` for every terminally failed request
    #[must_use]
    pub fn with_failed_request_handler(mut self, handler: FailedRequestHandler) -> Self {
        self.failed_handler = Some(handler);
        self
    }

    /// Override the finished condition checked after the crawl cap
    #[must_use]
    pub fn with_is_finished_function(
        mut self,
        function: Arc<dyn Fn() -> BoxBoolFuture + Send + Sync>,
    ) -> Self {
        self.user_is_finished = Some(function);
        self
    }

    /// Use a caller-constructed session pool
    #[must_use]
    pub fn with_session_pool(mut self, pool: Arc<SessionPool>) -> Self {
        self.session_pool = Some(pool);
        self
    }

    /// Use a caller-constructed statistics tracker
    #[must_use]
    pub fn with_statistics(mut self, stats: Arc<Statistics>) -> Self {
        self.stats = stats;
        self
    }

    /// Use a caller-constructed event bus
    ///
    /// The bus is per-crawler; subscriptions attach when `run` starts and
    /// detach when it completes.
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Feed the autoscaled pool from this load probe
    #[must_use]
    pub fn with_system_info(mut self, system_info: Arc<dyn SystemInfoSource>) -> Self {
        self.system_info = Some(system_info);
        self
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    #[must_use]
    pub fn session_pool(&self) -> Option<&Arc<SessionPool>> {
        self.session_pool.as_ref()
    }

    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Requests processed so far (handled + terminally failed)
    #[must_use]
    pub fn handled_count(&self) -> usize {
        self.processed_count.load(Ordering::Acquire)
    }

    /// Run until the source is exhausted or the crawl cap is reached
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if let Some(session_pool) = &self.session_pool {
            session_pool
                .initialize(Some(&self.bus))
                .await
                .context("initializing session pool")?;
        }
        self.stats
            .initialize(Some(&self.bus))
            .await
            .context("initializing statistics")?;
        self.stats
            .start_periodic_logging(self.config.pool.logging_interval);
        self.bus.start_periodic_persistence(PERSIST_STATE_INTERVAL);

        let mut pool = AutoscaledPool::new(self.config.pool.clone(), self.pool_hooks());
        if let Some(system_info) = &self.system_info {
            pool = pool.with_system_info(Arc::clone(system_info));
        }
        let pool = Arc::new(pool);

        let bus_listener = self.spawn_bus_listener(&pool);
        let result = pool.run().await;
        bus_listener.abort();

        if let Some(session_pool) = &self.session_pool {
            session_pool.teardown().await;
        }
        self.stats.teardown().await;
        self.bus.shutdown();

        let snapshot = self.stats.snapshot();
        info!(
            "Crawl complete: {} finished, {} failed",
            snapshot.finished_jobs, snapshot.failed_jobs
        );
        result
    }

    fn pool_hooks(self: &Arc<Self>) -> PoolHooks {
        let run_crawler = Arc::clone(self);
        let ready_crawler = Arc::clone(self);
        let finished_crawler = Arc::clone(self);
        PoolHooks {
            run_task: Arc::new(move || {
                let crawler = Arc::clone(&run_crawler);
                Box::pin(async move { crawler.run_task().await })
            }),
            is_task_ready: Arc::new(move || {
                let crawler = Arc::clone(&ready_crawler);
                Box::pin(async move { crawler.is_task_ready().await })
            }),
            is_finished: Arc::new(move || {
                let crawler = Arc::clone(&finished_crawler);
                Box::pin(async move { crawler.is_finished().await })
            }),
        }
    }

    fn spawn_bus_listener(self: &Arc<Self>, pool: &Arc<AutoscaledPool>) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        let crawler = Arc::clone(self);
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(SchedulerEvent::Migrating { .. }) => {
                        crawler.handle_migration(&pool).await;
                    }
                    Ok(SchedulerEvent::CpuInfo {
                        is_cpu_overloaded, ..
                    }) => {
                        pool.record_external_cpu_sample(is_cpu_overloaded);
                    }
                    Ok(SchedulerEvent::Shutdown { .. })
                    | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(SchedulerEvent::PersistState { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Crawler bus listener lagged by {missed} events");
                    }
                }
            }
        })
    }

    /// Pause, drain up to the migration bound, then force persistence
    async fn handle_migration(&self, pool: &Arc<AutoscaledPool>) {
        info!("Migration signal received; pausing crawl and persisting state");
        let drained = pool.pause(SAFE_MIGRATION_WAIT).await;
        if !drained {
            warn!("Migration drain timed out; persisting with tasks still in flight");
        }
        if let Err(e) = self.source.persist_state().await {
            warn!("Source state persistence during migration failed: {e}");
        }
        if let Some(session_pool) = &self.session_pool {
            if let Err(e) = session_pool.persist_state().await {
                warn!("Session pool persistence during migration failed: {e}");
            }
        }
        if let Err(e) = self.stats.persist_state().await {
            warn!("Statistics persistence during migration failed: {e}");
        }
    }

    async fn is_task_ready(&self) -> Result<bool> {
        if let Some(cap) = self.config.max_requests_per_crawl
            && self.processed_count.load(Ordering::Acquire) >= cap
        {
            if !self.cap_logged.swap(true, Ordering::AcqRel) {
                info!(
                    "Crawler reached the max_requests_per_crawl cap of {cap}; no new requests will be started."
                );
            }
            return Ok(false);
        }
        Ok(!self.source.is_empty().await?)
    }

    async fn is_finished(&self) -> Result<bool> {
        if let Some(cap) = self.config.max_requests_per_crawl
            && self.processed_count.load(Ordering::Acquire) >= cap
        {
            return Ok(true);
        }
        if let Some(user_is_finished) = &self.user_is_finished {
            return user_is_finished().await;
        }
        Ok(self.source.is_finished().await?)
    }

    /// One unit of pool work: fetch, process, record the outcome
    async fn run_task(&self) -> Result<()> {
        let session = self.session_pool.as_ref().map(|pool| pool.get_session());
        let Some(mut request) = self.source.fetch_next_request().await? else {
            return Ok(());
        };
        request.loaded_url = None;

        let job_id = request
            .id
            .clone()
            .unwrap_or_else(|| request.unique_key.clone());
        self.stats.start_job(&job_id);

        let context = CrawlingContext::new(request, session.clone());
        let shared_request = Arc::clone(&context.request);
        let raw_result = self.invoke_with_deadline(context).await;
        // Pick up handler-side mutations (loaded_url, user_data).
        let mut request = shared_request.lock().clone();
        let outcome = self.classify_outcome(&mut request, session.as_ref(), raw_result);

        match outcome {
            HandlerOutcome::Success => {
                self.source
                    .mark_request_handled(&request)
                    .await
                    .context("storage failure while marking request handled; aborting crawl")?;
                self.stats.finish_job(&job_id);
                if let Some(session) = &session {
                    session.mark_good();
                }
                self.processed_count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            HandlerOutcome::RetriableFailure(error) => {
                request.retry_state.retry_count += 1;
                debug!(
                    "Retrying {} ({}/{}): {error:#}",
                    request.url,
                    request.retry_state.retry_count,
                    request.effective_max_retries(self.config.max_request_retries)
                );
                self.source
                    .reclaim_request(&request, false)
                    .await
                    .context("reclaim failed inside the retry path; crawl state is unknown")?;
                Ok(())
            }
            HandlerOutcome::TerminalFailure(error) => {
                self.fail_request(request, &job_id, error).await
            }
        }
    }

    /// Run the user handler under its deadline
    ///
    /// On expiry the invocation resolves with an error but the spawned
    /// work is not killed; its eventual result is discarded.
    async fn invoke_with_deadline(&self, context: CrawlingContext) -> Result<()> {
        let future = (self.handler)(context);
        let mut join = tokio::spawn(future);
        let secs = self.config.handle_request_timeout.as_secs();
        match tokio::time::timeout(self.config.handle_request_timeout, &mut join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(anyhow::anyhow!("request handler panicked: {join_error}")),
            Err(_) => Err(anyhow::Error::new(CrawlError::HandlerTimeout { secs })),
        }
    }

    /// Record the failure and decide the pipeline branch
    fn classify_outcome(
        &self,
        request: &mut Request,
        session: Option<&Session>,
        result: Result<()>,
    ) -> HandlerOutcome {
        let Err(error) = result else {
            return HandlerOutcome::Success;
        };

        request.push_error_message(format!("{error:#}"));

        let kind = error.downcast_ref::<CrawlError>();
        if let Some(session) = session
            && kind.is_none_or(CrawlError::penalizes_session)
        {
            session.mark_bad();
        }

        if request.retry_state.no_retry {
            return HandlerOutcome::TerminalFailure(error);
        }

        let blocked_failures = request
            .error_messages
            .iter()
            .filter(|m| m.contains("Request blocked - received"))
            .count() as u32;
        if blocked_failures > 0 && blocked_failures >= self.config.max_session_rotations {
            warn!(
                "Request {} exhausted {blocked_failures} session rotations; giving up",
                request.url
            );
            return HandlerOutcome::TerminalFailure(anyhow::Error::new(
                CrawlError::SessionDepleted {
                    rotations: blocked_failures,
                },
            ));
        }

        let max_retries = request.effective_max_retries(self.config.max_request_retries);
        if request.retry_state.retry_count >= max_retries {
            return HandlerOutcome::TerminalFailure(error);
        }

        HandlerOutcome::RetriableFailure(error)
    }

    /// Terminal path: notify user code, mark handled, count the failure
    async fn fail_request(
        &self,
        request: Request,
        job_id: &str,
        error: anyhow::Error,
    ) -> Result<()> {
        warn!(
            "Request {} failed terminally after {} attempts: {error:#}",
            request.url,
            request.retry_state.retry_count + 1
        );
        self.stats.fail_job(job_id);

        if let Some(failed_handler) = &self.failed_handler {
            if let Err(secondary) = failed_handler(request.clone(), error).await {
                error!(
                    "handle_failed_request_function raised; crawl state is unknown: {secondary:#}"
                );
                return Err(secondary.context("failed-request handler raised"));
            }
        }

        self.source
            .mark_request_handled(&request)
            .await
            .context("storage failure while marking a failed request handled; crawl state is unknown")?;
        self.processed_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
