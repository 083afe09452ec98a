//! Browser driver collaborator traits
//!
//! Actual engine bindings live outside this crate. The pool only needs
//! three capabilities: launch a browser, open pages on it, navigate and
//! close those pages.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error from the driver binding
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Page creation failed: {0}")]
    PageCreateFailed(String),

    #[error("Navigation to '{url}' failed: {message}")]
    Navigation { url: String, message: String },

    #[error("Browser already closed")]
    Closed,
}

/// Options a browser is launched with
///
/// `extra` carries driver-specific settings the pool does not interpret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchContext {
    pub headless: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result of a page navigation
#[derive(Debug, Clone)]
pub struct NavigationResponse {
    pub status: u16,
    /// Final URL after redirects
    pub url: String,
}

/// Launches browsers
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, context: &LaunchContext) -> Result<Arc<dyn BrowserHandle>, BrowserError>;
}

/// A running browser instance
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A single page inside a browser
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Stable id used to map the page back to its browser
    fn id(&self) -> String;

    /// Navigate and report the landing status and final URL
    async fn goto(&self, url: &str) -> Result<NavigationResponse, BrowserError>;

    /// Cookies visible on the page, as name/value pairs
    ///
    /// Drivers without cookie access keep the default empty answer.
    async fn cookies(&self) -> Result<Vec<(String, String)>, BrowserError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), BrowserError>;
}
