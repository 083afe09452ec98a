//! Ordered, restartable list of seed requests
//!
//! A list is a finite sequence with a cursor. Seeds come from literal
//! request records and from remote text files (`requests_from_url`)
//! downloaded through the [`Transport`] collaborator. State persists as
//! `{ next_index, in_progress, handled_count }`; after a restart the
//! in-progress entries are served again before the cursor advances.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::transport::{HttpTransport, Transport, extract_urls_from_text, rewrite_google_sheets_url};
use super::{RequestSource, SourceError};
use crate::request::Request;
use crate::storage::KeyValueStore;

/// One seed entry
#[derive(Debug, Clone)]
pub enum RequestListSource {
    /// A literal request record
    Request(Request),
    /// A remote text file to extract URLs from, in document order
    RequestsFromUrl {
        url: String,
        /// Overrides the default URL matcher
        regex: Option<Regex>,
    },
}

impl RequestListSource {
    /// Shorthand for a literal URL seed
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self::Request(Request::new(url))
    }

    /// Shorthand for a remote seed file with the default matcher
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::RequestsFromUrl {
            url: url.into(),
            regex: None,
        }
    }
}

/// Persisted list state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestListState {
    pub next_index: usize,
    pub in_progress: Vec<usize>,
    pub handled_count: usize,
}

#[derive(Debug, Default)]
struct ListInner {
    requests: Vec<Request>,
    by_unique_key: HashMap<String, usize>,
    /// Cursor over indices never served yet
    next_index: usize,
    /// Reclaimed indices, re-served before the cursor advances
    reclaimed: BTreeSet<usize>,
    in_progress: HashSet<usize>,
    handled: HashSet<usize>,
    initialized: bool,
}

/// FIFO of seed requests with a persistable cursor
pub struct RequestList {
    sources: Mutex<Vec<RequestListSource>>,
    transport: Arc<dyn Transport>,
    proxy_url: Option<String>,
    store: Option<(Arc<dyn KeyValueStore>, String)>,
    inner: Mutex<ListInner>,
    handled_count: AtomicUsize,
}

impl RequestList {
    /// Create a list over the given seed sources
    ///
    /// The list is unusable until [`RequestList::initialize`] runs.
    #[must_use]
    pub fn new(sources: Vec<RequestListSource>) -> Self {
        Self {
            sources: Mutex::new(sources),
            transport: Arc::new(HttpTransport::new()),
            proxy_url: None,
            store: None,
            inner: Mutex::new(ListInner::default()),
            handled_count: AtomicUsize::new(0),
        }
    }

    /// Replace the download transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Route seed downloads through a proxy
    #[must_use]
    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    /// Persist and restore the cursor under `state_key`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>, state_key: impl Into<String>) -> Self {
        self.store = Some((store, state_key.into()));
        self
    }

    /// Load seeds and restore any persisted cursor
    ///
    /// Remote seed files are downloaded in source order, so the final
    /// sequence is stable across restarts as long as the sources and the
    /// remote files do not change.
    pub async fn initialize(&self) -> Result<(), SourceError> {
        let sources: Vec<RequestListSource> = self.sources.lock().drain(..).collect();
        let mut loaded = Vec::new();

        for source in sources {
            match source {
                RequestListSource::Request(request) => loaded.push(request),
                RequestListSource::RequestsFromUrl { url, regex } => {
                    let download_url = rewrite_google_sheets_url(&url);
                    let body = self
                        .transport
                        .download_text(&download_url, self.proxy_url.as_deref())
                        .await?;
                    let urls = extract_urls_from_text(&body, regex.as_ref());
                    info!("Seed file {url} contributed {} URLs", urls.len());
                    loaded.extend(urls.into_iter().map(Request::new));
                }
            }
        }

        let mut inner = self.inner.lock();
        for request in loaded {
            if inner.by_unique_key.contains_key(&request.unique_key) {
                debug!("Skipping duplicate seed '{}'", request.unique_key);
                continue;
            }
            let index = inner.requests.len();
            inner.by_unique_key.insert(request.unique_key.clone(), index);
            inner.requests.push(request);
        }
        inner.initialized = true;
        let total = inner.requests.len();
        drop(inner);

        self.restore_state().await?;
        info!("Request list initialized with {total} seeds");
        Ok(())
    }

    async fn restore_state(&self) -> Result<(), SourceError> {
        let Some((store, key)) = &self.store else {
            return Ok(());
        };
        let state: Option<RequestListState> = crate::storage::get_json(store.as_ref(), key)
            .await
            .map_err(|e| SourceError::StorageUnavailable(e.to_string()))?;
        let Some(state) = state else {
            return Ok(());
        };

        let mut inner = self.inner.lock();
        if state.next_index > inner.requests.len() {
            warn!(
                "Persisted list state expects {} seeds but only {} are loaded; ignoring state",
                state.next_index,
                inner.requests.len()
            );
            return Ok(());
        }

        inner.next_index = state.next_index;
        inner.reclaimed.clear();
        inner.in_progress.clear();
        inner.handled.clear();
        // Entries that were in flight when the snapshot was taken must be
        // served again.
        for index in &state.in_progress {
            if *index < state.next_index {
                inner.reclaimed.insert(*index);
            }
        }
        for index in 0..state.next_index {
            if !inner.reclaimed.contains(&index) {
                inner.handled.insert(index);
            }
        }
        let handled = inner.handled.len();
        if handled != state.handled_count {
            warn!(
                "Restored handled set ({handled}) disagrees with persisted handled_count ({})",
                state.handled_count
            );
        }
        self.handled_count.store(handled, Ordering::Release);
        info!(
            "Request list state restored: cursor at {}, {} to re-serve, {handled} handled",
            state.next_index,
            inner.reclaimed.len()
        );
        Ok(())
    }

    /// Total seeds loaded
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Whether no seeds were loaded
    #[must_use]
    pub fn is_empty_list(&self) -> bool {
        self.inner.lock().requests.is_empty()
    }

    /// Current state record, as it would be persisted
    #[must_use]
    pub fn state(&self) -> RequestListState {
        let inner = self.inner.lock();
        let mut in_progress: Vec<usize> = inner
            .in_progress
            .iter()
            .chain(inner.reclaimed.iter())
            .copied()
            .collect();
        in_progress.sort_unstable();
        RequestListState {
            next_index: inner.next_index,
            in_progress,
            handled_count: inner.handled.len(),
        }
    }

    fn index_of(&self, request: &Request) -> Result<usize, SourceError> {
        let inner = self.inner.lock();
        inner
            .by_unique_key
            .get(&request.unique_key)
            .copied()
            .ok_or_else(|| SourceError::UnknownRequest {
                id: request.unique_key.clone(),
            })
    }

    fn ensure_initialized(inner: &ListInner) -> Result<(), SourceError> {
        if inner.initialized {
            Ok(())
        } else {
            Err(SourceError::NotInitialized)
        }
    }
}

#[async_trait]
impl RequestSource for RequestList {
    async fn fetch_next_request(&self) -> Result<Option<Request>, SourceError> {
        let mut inner = self.inner.lock();
        Self::ensure_initialized(&inner)?;

        if let Some(index) = inner.reclaimed.iter().next().copied() {
            inner.reclaimed.remove(&index);
            inner.in_progress.insert(index);
            return Ok(Some(inner.requests[index].clone()));
        }

        if inner.next_index < inner.requests.len() {
            let index = inner.next_index;
            inner.next_index += 1;
            inner.in_progress.insert(index);
            return Ok(Some(inner.requests[index].clone()));
        }

        Ok(None)
    }

    async fn reclaim_request(&self, request: &Request, _forefront: bool) -> Result<(), SourceError> {
        let index = self.index_of(request)?;
        let mut inner = self.inner.lock();
        if !inner.in_progress.remove(&index) {
            return Err(SourceError::NotInProgress {
                id: request.unique_key.clone(),
            });
        }
        inner.requests[index] = request.clone();
        inner.reclaimed.insert(index);
        Ok(())
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), SourceError> {
        let index = self.index_of(request)?;
        let mut inner = self.inner.lock();
        if !inner.in_progress.remove(&index) {
            return Err(SourceError::NotInProgress {
                id: request.unique_key.clone(),
            });
        }
        inner.requests[index] = request.clone();
        inner.handled.insert(index);
        drop(inner);
        self.handled_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool, SourceError> {
        let inner = self.inner.lock();
        Self::ensure_initialized(&inner)?;
        Ok(inner.reclaimed.is_empty() && inner.next_index >= inner.requests.len())
    }

    async fn is_finished(&self) -> Result<bool, SourceError> {
        let inner = self.inner.lock();
        Self::ensure_initialized(&inner)?;
        Ok(inner.reclaimed.is_empty()
            && inner.in_progress.is_empty()
            && inner.next_index >= inner.requests.len())
    }

    fn handled_count(&self) -> usize {
        self.handled_count.load(Ordering::Acquire)
    }

    async fn persist_state(&self) -> Result<(), SourceError> {
        let Some((store, key)) = &self.store else {
            return Ok(());
        };
        // Snapshot synchronously; the write happens afterwards.
        let state = self.state();
        crate::storage::set_json(store.as_ref(), key, &state)
            .await
            .map_err(|e| SourceError::StorageUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn seeds(urls: &[&str]) -> Vec<RequestListSource> {
        urls.iter().map(|u| RequestListSource::url(*u)).collect()
    }

    #[tokio::test]
    async fn test_serves_seeds_in_order() {
        let list = RequestList::new(seeds(&[
            "https://example.com/1",
            "https://example.com/2",
        ]));
        list.initialize().await.expect("initialize");

        let first = list.fetch_next_request().await.expect("fetch").expect("seed");
        assert_eq!(first.url, "https://example.com/1");
        let second = list.fetch_next_request().await.expect("fetch").expect("seed");
        assert_eq!(second.url, "https://example.com/2");
        assert!(list.fetch_next_request().await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_seeds_collapse() {
        let list = RequestList::new(seeds(&[
            "https://example.com/a",
            "https://example.com/a/",
        ]));
        list.initialize().await.expect("initialize");
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_reclaimed_served_before_cursor() {
        let list = RequestList::new(seeds(&[
            "https://example.com/1",
            "https://example.com/2",
        ]));
        list.initialize().await.expect("initialize");

        let first = list.fetch_next_request().await.expect("fetch").expect("seed");
        list.reclaim_request(&first, false).await.expect("reclaim");
        let again = list.fetch_next_request().await.expect("fetch").expect("seed");
        assert_eq!(again.url, first.url);
    }

    #[tokio::test]
    async fn test_state_round_trip_reserves_in_progress() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let list = RequestList::new(seeds(&[
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/3",
        ]))
        .with_store(store.clone(), "LIST_STATE");
        list.initialize().await.expect("initialize");

        let first = list.fetch_next_request().await.expect("fetch").expect("seed");
        list.mark_request_handled(&first).await.expect("handle");
        let second = list.fetch_next_request().await.expect("fetch").expect("seed");
        // `second` is in flight when the snapshot is taken.
        let _ = second;
        list.persist_state().await.expect("persist");

        let resumed = RequestList::new(seeds(&[
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/3",
        ]))
        .with_store(store, "LIST_STATE");
        resumed.initialize().await.expect("re-initialize");

        assert_eq!(resumed.handled_count(), 1);
        let reserved = resumed
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("in-progress entry must be re-served");
        assert_eq!(reserved.url, "https://example.com/2");
        let next = resumed
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("cursor continues");
        assert_eq!(next.url, "https://example.com/3");
    }

    #[tokio::test]
    async fn test_not_initialized_is_an_error() {
        let list = RequestList::new(seeds(&["https://example.com/1"]));
        let err = list.is_empty().await.expect_err("must require initialize");
        assert!(matches!(err, SourceError::NotInitialized));
    }
}
