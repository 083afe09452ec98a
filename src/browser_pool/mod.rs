//! Driver-agnostic browser pool
//!
//! Provisions pages across a population of browsers, retires browsers by
//! age, page count or session retirement, and closes retired browsers
//! once their last page is gone. A periodic kill-stale loop sweeps
//! browsers that outlived their welcome.
//!
//! Browser lifecycle: `Launching -> Active -> Retired -> Closed`.

pub mod driver;

pub use driver::{
    BrowserDriver, BrowserError, BrowserHandle, LaunchContext, NavigationResponse, PageHandle,
};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the browser pool
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Pages a browser may have open at once
    pub max_open_pages_per_browser: usize,
    /// Total pages after which a browser is retired
    pub retire_browser_after_page_count: usize,
    /// Age after which a browser is retired
    pub kill_browser_after: Duration,
    /// Interval of the kill-stale sweep
    pub browser_killer_interval: Duration,
    /// Launch options for new browsers
    pub launch_context: LaunchContext,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_open_pages_per_browser: 20,
            retire_browser_after_page_count: 100,
            kill_browser_after: Duration::from_secs(300),
            browser_killer_interval: Duration::from_secs(60),
            launch_context: LaunchContext {
                headless: true,
                ..LaunchContext::default()
            },
        }
    }
}

/// Lifecycle state of a pooled browser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Launching,
    Active,
    Retired,
    Closed,
}

/// Pool-side wrapper around one running browser
pub struct BrowserController {
    id: String,
    handle: Arc<dyn BrowserHandle>,
    launch_context: LaunchContext,
    state: Mutex<BrowserState>,
    /// Arbitrary bindings, e.g. the session this browser serves
    user_data: Mutex<serde_json::Map<String, serde_json::Value>>,
    open_pages: AtomicUsize,
    total_pages: AtomicUsize,
    launched_at: Instant,
}

impl BrowserController {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> BrowserState {
        *self.state.lock()
    }

    #[must_use]
    pub fn launch_context(&self) -> &LaunchContext {
        &self.launch_context
    }

    #[must_use]
    pub fn open_pages(&self) -> usize {
        self.open_pages.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages.load(Ordering::Acquire)
    }

    /// Read a user-data binding
    #[must_use]
    pub fn user_data_entry(&self, key: &str) -> Option<serde_json::Value> {
        self.user_data.lock().get(key).cloned()
    }

    /// Write a user-data binding
    pub fn set_user_data_entry(&self, key: impl Into<String>, value: serde_json::Value) {
        self.user_data.lock().insert(key.into(), value);
    }

    /// Move an active browser to `Retired`; it accepts no new pages
    pub fn retire(&self) {
        let mut state = self.state.lock();
        if *state == BrowserState::Active {
            *state = BrowserState::Retired;
            debug!(browser = %self.id, "browser retired");
        }
    }

    fn accepts_pages(&self, config: &BrowserPoolConfig) -> bool {
        self.state() == BrowserState::Active
            && self.open_pages() < config.max_open_pages_per_browser
            && self.total_pages() < config.retire_browser_after_page_count
    }
}

/// Boxed future returned by pool hooks
pub type BoxHookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
/// Hook over a browser controller (post-launch, pre-page-create)
pub type BrowserHook = Arc<dyn Fn(Arc<BrowserController>) -> BoxHookFuture + Send + Sync>;
/// Hook over a page and its controller (page create/close)
pub type PageHook =
    Arc<dyn Fn(Arc<dyn PageHandle>, Arc<BrowserController>) -> BoxHookFuture + Send + Sync>;
/// Synchronous mutator over the launch context (pre-launch)
pub type LaunchContextHook = Arc<dyn Fn(&mut LaunchContext) -> anyhow::Result<()> + Send + Sync>;

/// Ordered hook chains; each chain runs sequentially
///
/// Later hooks regularly depend on earlier hooks' side effects, so the
/// pool never runs a chain in parallel.
#[derive(Clone, Default)]
pub struct BrowserPoolHooks {
    pub pre_launch: Vec<LaunchContextHook>,
    pub post_launch: Vec<BrowserHook>,
    pub pre_page_create: Vec<BrowserHook>,
    pub post_page_create: Vec<PageHook>,
    pub pre_page_close: Vec<PageHook>,
    pub post_page_close: Vec<PageHook>,
}

/// Pool of browsers handing out pages
pub struct BrowserPool {
    config: BrowserPoolConfig,
    driver: Arc<dyn BrowserDriver>,
    hooks: BrowserPoolHooks,
    browsers: Mutex<Vec<Arc<BrowserController>>>,
    pages: DashMap<String, Arc<BrowserController>>,
    killer_handle: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl BrowserPool {
    /// Create a pool over `driver` (does not start the kill-stale loop)
    #[must_use]
    pub fn new(config: BrowserPoolConfig, driver: Arc<dyn BrowserDriver>) -> Arc<Self> {
        Self::with_hooks(config, driver, BrowserPoolHooks::default())
    }

    /// Create a pool with hook chains
    #[must_use]
    pub fn with_hooks(
        config: BrowserPoolConfig,
        driver: Arc<dyn BrowserDriver>,
        hooks: BrowserPoolHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            driver,
            hooks,
            browsers: Mutex::new(Vec::new()),
            pages: DashMap::new(),
            killer_handle: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Start the periodic kill-stale sweep
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let interval = self.config.browser_killer_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            while !pool.destroyed.load(Ordering::Acquire) {
                ticker.tick().await;
                pool.kill_stale().await;
            }
        });
        let previous = self.killer_handle.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Browsers currently tracked (any state but `Closed`)
    #[must_use]
    pub fn browser_count(&self) -> usize {
        self.browsers
            .lock()
            .iter()
            .filter(|c| c.state() != BrowserState::Closed)
            .count()
    }

    /// Provision a page, launching a new browser if no active one has room
    pub async fn new_page(self: &Arc<Self>) -> Result<Arc<dyn PageHandle>, BrowserError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(BrowserError::Closed);
        }

        let controller = match self.pick_available() {
            Some(controller) => controller,
            None => self.launch_browser().await?,
        };

        for hook in &self.hooks.pre_page_create {
            if let Err(e) = hook(Arc::clone(&controller)).await {
                warn!(browser = %controller.id, "pre-page-create hook failed: {e:#}");
                return Err(BrowserError::PageCreateFailed(e.to_string()));
            }
        }

        let page = controller.handle.new_page().await?;
        controller.open_pages.fetch_add(1, Ordering::AcqRel);
        controller.total_pages.fetch_add(1, Ordering::AcqRel);
        self.pages.insert(page.id(), Arc::clone(&controller));

        for hook in &self.hooks.post_page_create {
            if let Err(e) = hook(Arc::clone(&page), Arc::clone(&controller)).await {
                warn!(browser = %controller.id, "post-page-create hook failed: {e:#}");
                self.close_page(&page).await;
                return Err(BrowserError::PageCreateFailed(e.to_string()));
            }
        }

        Ok(page)
    }

    /// The controller owning `page`, if the pool provisioned it
    #[must_use]
    pub fn get_browser_controller_by_page(
        &self,
        page: &dyn PageHandle,
    ) -> Option<Arc<BrowserController>> {
        self.pages.get(&page.id()).map(|entry| Arc::clone(&entry))
    }

    /// Close a page; close errors are swallowed
    ///
    /// A retired browser whose last page closes is closed as well.
    pub async fn close_page(&self, page: &Arc<dyn PageHandle>) {
        let controller = self.pages.remove(&page.id()).map(|(_, c)| c);

        if let Some(controller) = &controller {
            for hook in &self.hooks.pre_page_close {
                if let Err(e) = hook(Arc::clone(page), Arc::clone(controller)).await {
                    warn!(browser = %controller.id, "pre-page-close hook failed: {e:#}");
                }
            }
        }

        if let Err(e) = page.close().await {
            debug!("page close failed (ignored): {e}");
        }

        if let Some(controller) = controller {
            controller.open_pages.fetch_sub(1, Ordering::AcqRel);
            for hook in &self.hooks.post_page_close {
                if let Err(e) = hook(Arc::clone(page), Arc::clone(&controller)).await {
                    warn!(browser = %controller.id, "post-page-close hook failed: {e:#}");
                }
            }
            if controller.state() == BrowserState::Retired && controller.open_pages() == 0 {
                self.close_browser(&controller).await;
            }
        }
    }

    /// Retire every browser bound to `session_id`
    ///
    /// A browser that hosted a retired session is not reused for new
    /// pages; it closes once its in-flight pages finish.
    pub fn retire_browsers_for_session(&self, session_id: &str) {
        let browsers = self.browsers.lock();
        for controller in browsers.iter() {
            let bound = controller
                .user_data_entry("session_id")
                .and_then(|v| v.as_str().map(String::from));
            if bound.as_deref() == Some(session_id) {
                controller.retire();
            }
        }
    }

    /// Close everything and stop background work
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(handle) = self.killer_handle.lock().take() {
            handle.abort();
        }
        let browsers: Vec<_> = self.browsers.lock().drain(..).collect();
        futures::future::join_all(
            browsers
                .iter()
                .map(|controller| self.close_browser(controller)),
        )
        .await;
        self.pages.clear();
        info!("browser pool destroyed");
    }

    fn pick_available(&self) -> Option<Arc<BrowserController>> {
        let browsers = self.browsers.lock();
        browsers
            .iter()
            .find(|c| c.accepts_pages(&self.config))
            .cloned()
    }

    async fn launch_browser(self: &Arc<Self>) -> Result<Arc<BrowserController>, BrowserError> {
        let mut launch_context = self.config.launch_context.clone();
        for hook in &self.hooks.pre_launch {
            hook(&mut launch_context)
                .map_err(|e| BrowserError::LaunchFailed(format!("pre-launch hook failed: {e}")))?;
        }

        let id = format!("browser_{}", uuid::Uuid::new_v4().simple());
        debug!(browser = %id, "launching browser");
        let handle = self.driver.launch(&launch_context).await?;

        let controller = Arc::new(BrowserController {
            id,
            handle,
            launch_context,
            state: Mutex::new(BrowserState::Launching),
            user_data: Mutex::new(serde_json::Map::new()),
            open_pages: AtomicUsize::new(0),
            total_pages: AtomicUsize::new(0),
            launched_at: Instant::now(),
        });

        for hook in &self.hooks.post_launch {
            if let Err(e) = hook(Arc::clone(&controller)).await {
                warn!(browser = %controller.id, "post-launch hook failed: {e:#}");
                self.close_browser(&controller).await;
                return Err(BrowserError::LaunchFailed(e.to_string()));
            }
        }

        *controller.state.lock() = BrowserState::Active;
        self.browsers.lock().push(Arc::clone(&controller));
        Ok(controller)
    }

    async fn close_browser(&self, controller: &Arc<BrowserController>) {
        {
            let mut state = controller.state.lock();
            if *state == BrowserState::Closed {
                return;
            }
            *state = BrowserState::Closed;
        }
        if let Err(e) = controller.handle.close().await {
            warn!(browser = %controller.id, "browser close failed: {e}");
        }
        debug!(browser = %controller.id, "browser closed");
    }

    /// Retire overage browsers and close retired ones without pages
    async fn kill_stale(&self) {
        let candidates: Vec<Arc<BrowserController>> = {
            let mut browsers = self.browsers.lock();
            browsers.retain(|c| c.state() != BrowserState::Closed);
            browsers.clone()
        };

        for controller in candidates {
            let too_old = controller.launched_at.elapsed() >= self.config.kill_browser_after;
            let too_many_pages =
                controller.total_pages() >= self.config.retire_browser_after_page_count;
            if controller.state() == BrowserState::Active && (too_old || too_many_pages) {
                debug!(
                    browser = %controller.id,
                    too_old, too_many_pages, "retiring stale browser"
                );
                controller.retire();
            }
            if controller.state() == BrowserState::Retired && controller.open_pages() == 0 {
                self.close_browser(&controller).await;
            }
        }
    }
}

impl Drop for BrowserPool {
    fn drop(&mut self) {
        if let Some(handle) = self.killer_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Driver whose browsers and pages only count calls
    #[derive(Default)]
    struct StubDriver {
        launches: AtomicUsize,
    }

    struct StubBrowser;
    struct StubPage {
        id: String,
    }

    #[async_trait]
    impl BrowserDriver for StubDriver {
        async fn launch(
            &self,
            _context: &LaunchContext,
        ) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
            self.launches.fetch_add(1, Ordering::AcqRel);
            Ok(Arc::new(StubBrowser))
        }
    }

    #[async_trait]
    impl BrowserHandle for StubBrowser {
        async fn new_page(&self) -> Result<Arc<dyn PageHandle>, BrowserError> {
            Ok(Arc::new(StubPage {
                id: uuid::Uuid::new_v4().simple().to_string(),
            }))
        }

        async fn close(&self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    #[async_trait]
    impl PageHandle for StubPage {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn goto(&self, url: &str) -> Result<NavigationResponse, BrowserError> {
            Ok(NavigationResponse {
                status: 200,
                url: url.to_string(),
            })
        }

        async fn close(&self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    fn tight_config() -> BrowserPoolConfig {
        BrowserPoolConfig {
            max_open_pages_per_browser: 2,
            retire_browser_after_page_count: 3,
            ..BrowserPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pages_reuse_browser_until_cap() {
        let driver = Arc::new(StubDriver::default());
        let pool = BrowserPool::new(tight_config(), driver.clone());

        let a = pool.new_page().await.expect("page a");
        let _b = pool.new_page().await.expect("page b");
        assert_eq!(driver.launches.load(Ordering::Acquire), 1);

        // Browser is at its open-page cap; the third page needs a new one.
        let _c = pool.new_page().await.expect("page c");
        assert_eq!(driver.launches.load(Ordering::Acquire), 2);

        // Closing a page frees capacity on the first browser.
        pool.close_page(&a).await;
        let _d = pool.new_page().await.expect("page d");
        assert_eq!(driver.launches.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn test_controller_lookup_by_page() {
        let pool = BrowserPool::new(tight_config(), Arc::new(StubDriver::default()));
        let page = pool.new_page().await.expect("page");
        let controller = pool
            .get_browser_controller_by_page(page.as_ref())
            .expect("controller");
        assert_eq!(controller.open_pages(), 1);
        pool.close_page(&page).await;
        assert!(pool.get_browser_controller_by_page(page.as_ref()).is_none());
    }

    #[tokio::test]
    async fn test_retired_browser_closes_after_last_page() {
        let pool = BrowserPool::new(tight_config(), Arc::new(StubDriver::default()));
        let page = pool.new_page().await.expect("page");
        let controller = pool
            .get_browser_controller_by_page(page.as_ref())
            .expect("controller");

        controller.retire();
        assert_eq!(controller.state(), BrowserState::Retired);
        pool.close_page(&page).await;
        assert_eq!(controller.state(), BrowserState::Closed);
    }

    #[tokio::test]
    async fn test_session_retirement_retires_bound_browser() {
        let pool = BrowserPool::new(tight_config(), Arc::new(StubDriver::default()));
        let page = pool.new_page().await.expect("page");
        let controller = pool
            .get_browser_controller_by_page(page.as_ref())
            .expect("controller");
        controller.set_user_data_entry("session_id", serde_json::json!("session_1"));

        pool.retire_browsers_for_session("session_1");
        assert_eq!(controller.state(), BrowserState::Retired);
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = BrowserPoolHooks::default();
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            hooks
                .post_page_create
                .push(Arc::new(move |_page, _controller| {
                    let order = Arc::clone(&order);
                    Box::pin(async move {
                        order.lock().push(tag);
                        Ok(())
                    })
                }));
        }
        let pool = BrowserPool::with_hooks(tight_config(), Arc::new(StubDriver::default()), hooks);
        let _page = pool.new_page().await.expect("page");
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
