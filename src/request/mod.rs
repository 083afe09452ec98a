//! Request model
//!
//! A [`Request`] is the unit of work flowing through the scheduler: a URL
//! plus its metadata, retry state and error trail. Requests are created by
//! user code or by a request list, registered in a queue (which assigns
//! the id), fetched for processing, then either marked handled or
//! reclaimed for retry.

mod unique_key;

pub use unique_key::compute_unique_key;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// HTTP method carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        };
        f.write_str(name)
    }
}

/// Retry bookkeeping embedded in every request
///
/// Stored as a typed struct rather than a loose entry in `user_data`, so
/// the retry pipeline never has to parse dynamic values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Times this request has been handed back for retry
    pub retry_count: u32,
    /// Per-request override of the crawler-wide retry cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Fail terminally on the first error, regardless of retry caps
    #[serde(default)]
    pub no_retry: bool,
    /// Skip navigation for this request (browser crawler only)
    #[serde(default)]
    pub skip_navigation: bool,
}

/// A unit of crawl work: URL, metadata, retry state, error trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Opaque id, assigned exactly once by the queue on first enqueue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Deduplication key; equal keys collapse into one queue entry.
    /// Immutable after first enqueue.
    pub unique_key: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body bytes, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Opaque user payload; the scheduler never interprets it
    #[serde(default)]
    pub user_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub retry_state: RetryState,
    /// Final URL after navigation (redirects applied)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_url: Option<String>,
    /// Errors recorded across attempts, oldest first
    #[serde(default)]
    pub error_messages: Vec<String>,
}

impl Request {
    /// Create a request for `url` with the default unique key
    ///
    /// The unique key is the normalized form of the URL; pass an explicit
    /// key via [`Request::with_unique_key`] to group distinct URLs or to
    /// force separate entries for the same URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let unique_key = compute_unique_key(&url);
        Self {
            id: None,
            unique_key,
            url,
            method: HttpMethod::default(),
            headers: HashMap::new(),
            payload: None,
            user_data: serde_json::Map::new(),
            retry_state: RetryState::default(),
            loaded_url: None,
            error_messages: Vec::new(),
        }
    }

    /// Create a request with an explicit unique key
    #[must_use]
    pub fn with_unique_key(url: impl Into<String>, unique_key: impl Into<String>) -> Self {
        let mut request = Self::new(url);
        request.unique_key = unique_key.into();
        request
    }

    /// Replace the HTTP method
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Mark this request as single-attempt
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.retry_state.no_retry = true;
        self
    }

    /// Attach an opaque user-data entry
    #[must_use]
    pub fn user_data_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.user_data.insert(key.into(), value);
        self
    }

    /// The retry cap effective for this request
    #[must_use]
    pub fn effective_max_retries(&self, crawler_default: u32) -> u32 {
        self.retry_state.max_retries.unwrap_or(crawler_default)
    }

    /// Record an error for the current attempt
    pub fn push_error_message(&mut self, message: impl std::fmt::Display) {
        self.error_messages.push(message.to_string());
    }

    /// The id, if the request has been registered in a queue
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_unique_key_is_normalized_url() {
        let request = Request::new("HTTPS://Example.COM:443/Path/?q=1#frag");
        assert_eq!(request.unique_key, "https://example.com/Path?q=1");
    }

    #[test]
    fn test_explicit_unique_key_wins() {
        let request = Request::with_unique_key("https://example.com/a", "group-1");
        assert_eq!(request.unique_key, "group-1");
    }

    #[test]
    fn test_effective_max_retries_prefers_request_override() {
        let mut request = Request::new("https://example.com");
        assert_eq!(request.effective_max_retries(3), 3);
        request.retry_state.max_retries = Some(7);
        assert_eq!(request.effective_max_retries(3), 7);
    }

    #[test]
    fn test_error_trail_preserves_order() {
        let mut request = Request::new("https://example.com");
        request.push_error_message("first");
        request.push_error_message("second");
        assert_eq!(request.error_messages, vec!["first", "second"]);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut request = Request::new("https://example.com/a").no_retry();
        request.retry_state.retry_count = 2;
        request.push_error_message("boom");
        let json = serde_json::to_string(&request).expect("serialize");
        let back: Request = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.unique_key, request.unique_key);
        assert_eq!(back.retry_state, request.retry_state);
        assert_eq!(back.error_messages, request.error_messages);
    }
}
