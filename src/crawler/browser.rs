//! Browser-context crawler
//!
//! Wraps the basic crawler with a per-request page lifecycle: acquire a
//! page from the browser pool, bind the session to the owning browser,
//! run the ordered navigation hook chains, navigate under a deadline,
//! screen the landing status against the blocked set, hand the page to
//! the user handler, and close the page whatever happened.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::basic::{
    BasicCrawler, BasicCrawlerConfig, BoxHandlerFuture, CrawlingContext, FailedRequestHandler,
    RequestHandler,
};
use super::errors::CrawlError;
use crate::browser_pool::{BrowserPool, PageHandle};
use crate::events::EventBus;
use crate::session::{SessionPool, SessionPoolConfig};
use crate::sources::RequestSource;

/// Async hook over the crawling context, run around navigation
///
/// Hooks in a chain run strictly in order; later hooks may rely on
/// earlier hooks' writes to the shared context state.
pub type NavigationHook = Arc<dyn Fn(CrawlingContext) -> BoxHandlerFuture + Send + Sync>;

/// Browser crawler configuration
#[derive(Debug, Clone)]
pub struct BrowserCrawlerConfig {
    pub basic: BasicCrawlerConfig,
    /// Deadline for one `goto`
    pub navigation_timeout: Duration,
}

impl Default for BrowserCrawlerConfig {
    fn default() -> Self {
        Self {
            basic: BasicCrawlerConfig {
                use_session_pool: true,
                ..BasicCrawlerConfig::default()
            },
            navigation_timeout: Duration::from_secs(60),
        }
    }
}

/// The navigation layer injected as the basic crawler's handler
struct NavigationWrapper {
    browser_pool: Arc<BrowserPool>,
    user_handler: RequestHandler,
    pre_navigation: Vec<NavigationHook>,
    post_navigation: Vec<NavigationHook>,
    navigation_timeout: Duration,
    persist_cookies_per_session: bool,
    session_pool: Option<Arc<SessionPool>>,
}

impl NavigationWrapper {
    async fn handle(self: Arc<Self>, mut context: CrawlingContext) -> Result<()> {
        if context.request.lock().retry_state.skip_navigation {
            debug!("skip_navigation set; invoking handler without a page");
            return (self.user_handler)(context).await;
        }

        let page = self
            .browser_pool
            .new_page()
            .await
            .map_err(anyhow::Error::new)?;

        if let Some(controller) = self.browser_pool.get_browser_controller_by_page(page.as_ref()) {
            if let Some(session) = &context.session {
                controller.set_user_data_entry("session_id", serde_json::json!(session.id()));
            }
            context.proxy_info = controller.launch_context().proxy_url.clone();
        }
        context.page = Some(Arc::clone(&page));

        let result = self.navigate_and_handle(context, &page).await;
        // The page goes back whatever the outcome; close errors are
        // swallowed inside the pool.
        self.browser_pool.close_page(&page).await;
        result
    }

    async fn navigate_and_handle(
        &self,
        mut context: CrawlingContext,
        page: &Arc<dyn PageHandle>,
    ) -> Result<()> {
        for hook in &self.pre_navigation {
            hook(context.clone()).await?;
        }

        let url = context.url();
        let secs = self.navigation_timeout.as_secs();
        let response = match tokio::time::timeout(self.navigation_timeout, page.goto(&url)).await {
            Err(_) => {
                if let Some(session) = &context.session {
                    session.mark_bad();
                }
                return Err(anyhow::Error::new(CrawlError::NavigationTimeout { secs }));
            }
            Ok(Err(navigation_error)) => return Err(anyhow::Error::new(navigation_error)),
            Ok(Ok(response)) => response,
        };

        context.request.lock().loaded_url = Some(response.url.clone());

        if let Some(session) = &context.session
            && session.retire_on_blocked_status_codes(response.status)
        {
            if let Some(session_pool) = &self.session_pool {
                session_pool.emit_discarded(session.id());
            }
            return Err(anyhow::Error::new(CrawlError::RequestBlocked {
                status: response.status,
            }));
        }

        if self.persist_cookies_per_session
            && let Some(session) = &context.session
            && let Ok(cookies) = page.cookies().await
        {
            session.merge_cookies(cookies.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        context.response = Some(response);
        for hook in &self.post_navigation {
            hook(context.clone()).await?;
        }

        (self.user_handler)(context).await
    }
}

/// Builder for [`BrowserCrawler`]
pub struct BrowserCrawlerBuilder {
    source: Arc<dyn RequestSource>,
    browser_pool: Arc<BrowserPool>,
    handler: RequestHandler,
    failed_handler: Option<FailedRequestHandler>,
    pre_navigation: Vec<NavigationHook>,
    post_navigation: Vec<NavigationHook>,
    session_pool: Option<Arc<SessionPool>>,
    event_bus: Option<Arc<EventBus>>,
    config: BrowserCrawlerConfig,
}

impl BrowserCrawlerBuilder {
    #[must_use]
    pub fn with_config(mut self, config: BrowserCrawlerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_failed_request_handler(mut self, handler: FailedRequestHandler) -> Self {
        self.failed_handler = Some(handler);
        self
    }

    /// Append a pre-navigation hook; hooks run in append order
    #[must_use]
    pub fn with_pre_navigation_hook(mut self, hook: NavigationHook) -> Self {
        self.pre_navigation.push(hook);
        self
    }

    /// Append a post-navigation hook; hooks run in append order
    #[must_use]
    pub fn with_post_navigation_hook(mut self, hook: NavigationHook) -> Self {
        self.post_navigation.push(hook);
        self
    }

    #[must_use]
    pub fn with_session_pool(mut self, pool: Arc<SessionPool>) -> Self {
        self.session_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    #[must_use]
    pub fn build(self) -> BrowserCrawler {
        let session_pool = self.session_pool.or_else(|| {
            self.config
                .basic
                .use_session_pool
                .then(|| Arc::new(SessionPool::new(SessionPoolConfig::default())))
        });

        let wrapper = Arc::new(NavigationWrapper {
            browser_pool: Arc::clone(&self.browser_pool),
            user_handler: self.handler,
            pre_navigation: self.pre_navigation,
            post_navigation: self.post_navigation,
            navigation_timeout: self.config.navigation_timeout,
            persist_cookies_per_session: self.config.basic.persist_cookies_per_session,
            session_pool: session_pool.clone(),
        });
        let navigation_handler: RequestHandler = Arc::new(move |context| {
            let wrapper = Arc::clone(&wrapper);
            Box::pin(wrapper.handle(context))
        });

        let mut basic = BasicCrawler::new(self.source, navigation_handler, self.config.basic);
        if let Some(session_pool) = session_pool {
            basic = basic.with_session_pool(session_pool);
        }
        if let Some(failed_handler) = self.failed_handler {
            basic = basic.with_failed_request_handler(failed_handler);
        }
        if let Some(bus) = self.event_bus {
            basic = basic.with_event_bus(bus);
        }

        BrowserCrawler {
            basic: Arc::new(basic),
            browser_pool: self.browser_pool,
        }
    }
}

/// Crawler that renders each request in an external browser session
pub struct BrowserCrawler {
    basic: Arc<BasicCrawler>,
    browser_pool: Arc<BrowserPool>,
}

impl BrowserCrawler {
    /// Start building a browser crawler
    #[must_use]
    pub fn builder(
        source: Arc<dyn RequestSource>,
        browser_pool: Arc<BrowserPool>,
        handler: RequestHandler,
    ) -> BrowserCrawlerBuilder {
        BrowserCrawlerBuilder {
            source,
            browser_pool,
            handler,
            failed_handler: None,
            pre_navigation: Vec::new(),
            post_navigation: Vec::new(),
            session_pool: None,
            event_bus: None,
            config: BrowserCrawlerConfig::default(),
        }
    }

    /// The wrapped basic crawler (stats, session pool, counters)
    #[must_use]
    pub fn basic(&self) -> &Arc<BasicCrawler> {
        &self.basic
    }

    #[must_use]
    pub fn browser_pool(&self) -> &Arc<BrowserPool> {
        &self.browser_pool
    }

    /// Requests processed so far (handled + terminally failed)
    #[must_use]
    pub fn handled_count(&self) -> usize {
        self.basic.handled_count()
    }

    /// Run the crawl, then tear the browser population down
    pub async fn run(&self) -> Result<()> {
        self.browser_pool.start();
        let discarded_listener = self.spawn_discarded_listener();
        let result = self.basic.run().await;
        if let Some(listener) = discarded_listener {
            listener.abort();
        }
        self.browser_pool.destroy().await;
        result
    }

    /// Retire browsers whose session was discarded
    fn spawn_discarded_listener(&self) -> Option<JoinHandle<()>> {
        let session_pool = self.basic.session_pool()?;
        let mut receiver = session_pool.subscribe_discarded();
        let browser_pool = Arc::clone(&self.browser_pool);
        Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(session_id) => {
                        browser_pool.retire_browsers_for_session(&session_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }))
    }
}
