//! Seed-file transport
//!
//! The request list downloads `requests_from_url` seed files through this
//! collaborator. The default [`HttpTransport`] is a thin reqwest wrapper
//! with bounded retries; tests substitute their own implementation.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Matches URLs embedded in arbitrary text, one per match
///
/// Commas are excluded from the path charset so URLs survive CSV cells
/// and comma-separated prose.
pub static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"https?://[\w\-@:%.+~#=]{1,256}\.[a-z]{2,22}(:\d{1,5})?(/[\w\-@:%.+~#?&/=()]*)?",
    )
    .size_limit(64 * 1024 * 1024)
    .build()
    .expect("URL regex is valid")
});

/// Matches a Google Sheets share URL and captures the spreadsheet id
static GOOGLE_SHEET_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://docs\.google\.com/spreadsheets/d/([\w\-]+)")
        .expect("Google Sheets regex is valid")
});

/// Download attempts before giving up
const DOWNLOAD_MAX_ATTEMPTS: u32 = 3;
/// Base delay between download attempts; doubles per attempt
const DOWNLOAD_BACKOFF: Duration = Duration::from_millis(500);

/// Error downloading a seed file
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to download '{url}': {message}")]
    Download { url: String, message: String },

    #[error("Server returned status {status} for '{url}'")]
    BadStatus { url: String, status: u16 },

    #[error("Invalid proxy URL '{0}'")]
    InvalidProxy(String),
}

/// URL-fetch collaborator used by the request list
#[async_trait]
pub trait Transport: Send + Sync {
    /// Download the text body of `url`, optionally through a proxy
    async fn download_text(
        &self,
        url: &str,
        proxy_url: Option<&str>,
    ) -> Result<String, TransportError>;
}

/// Default reqwest-backed transport
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    /// Per-request timeout; `None` uses the reqwest default
    pub timeout: Option<Duration>,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn build_client(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|_| TransportError::InvalidProxy(proxy_url.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| TransportError::Download {
                url: String::new(),
                message: format!("client construction failed: {e}"),
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download_text(
        &self,
        url: &str,
        proxy_url: Option<&str>,
    ) -> Result<String, TransportError> {
        let client = self.build_client(proxy_url)?;
        let mut delay = DOWNLOAD_BACKOFF;
        let mut last_error = None;

        for attempt in 1..=DOWNLOAD_MAX_ATTEMPTS {
            match client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(TransportError::BadStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    return response.text().await.map_err(|e| TransportError::Download {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Seed download attempt {attempt}/{DOWNLOAD_MAX_ATTEMPTS} for {url} failed: {e}"
                    );
                    last_error = Some(e);
                    if attempt < DOWNLOAD_MAX_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(TransportError::Download {
            url: url.to_string(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Rewrite a Google Sheets share URL to its CSV export form
///
/// Any other URL is returned unchanged.
#[must_use]
pub fn rewrite_google_sheets_url(url: &str) -> String {
    if let Some(captures) = GOOGLE_SHEET_REGEX.captures(url) {
        let spreadsheet_id = &captures[1];
        let rewritten =
            format!("https://docs.google.com/spreadsheets/d/{spreadsheet_id}/gviz/tq?tqx=out:csv");
        debug!("Rewrote Google Sheets URL to CSV export: {rewritten}");
        return rewritten;
    }
    url.to_string()
}

/// Extract URLs from downloaded text, preserving document order
///
/// Uses the provided regex, or the default `URL_REGEX` when `None`.
#[must_use]
pub fn extract_urls_from_text(text: &str, pattern: Option<&Regex>) -> Vec<String> {
    let pattern = pattern.unwrap_or(&URL_REGEX);
    pattern
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}
