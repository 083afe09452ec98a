//! Durable request queue with at-most-one-in-flight dispatch
//!
//! The queue deduplicates by unique key, serves a FIFO head with a
//! forefront-insertion variant, and tracks which requests are currently
//! held by a task. The in-progress set is authoritative for "who holds
//! which request", which is what prevents double dispatch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{RequestSource, SourceError};
use crate::request::Request;
use crate::storage::KeyValueStore;

/// How long an eventually-consistent backend may keep reporting an empty
/// head while writes from another client are still propagating
pub const API_PROCESSED_REQUESTS_DELAY: Duration = Duration::from_secs(10);

/// Attempts for a persistence write before giving up
const PERSIST_MAX_ATTEMPTS: u32 = 3;
/// Base delay between persistence attempts; doubles per attempt
const PERSIST_BACKOFF: Duration = Duration::from_millis(100);

/// Result of [`RequestQueue::add_request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOperationInfo {
    /// Id of the stored request (fresh, or the existing entry's on dedup)
    pub request_id: String,
    /// A request with the same unique key was already present
    pub was_already_present: bool,
    /// That request had already reached the handled state
    pub was_already_handled: bool,
}

/// Ordering state, guarded by one lock so every transition is atomic
#[derive(Debug, Default)]
struct QueueOrdering {
    pending: VecDeque<String>,
    in_progress: HashSet<String>,
    handled: HashSet<String>,
    by_unique_key: HashMap<String, String>,
    /// First time `is_finished` observed an empty head, for the
    /// multiple-clients consistency wait
    empty_head_since: Option<Instant>,
}

/// Persisted snapshot of the queue
///
/// In-progress ids are serialized separately: a request in flight at
/// snapshot time must be re-served after a restart.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestQueueState {
    requests: Vec<Request>,
    pending: Vec<String>,
    in_progress: Vec<String>,
    handled: Vec<String>,
}

/// FIFO request queue with unique-key dedup, forefront priority and reclaim
pub struct RequestQueue {
    /// Request bodies by id; kept outside the ordering lock so body reads
    /// and updates don't contend with head operations
    requests: DashMap<String, Request>,
    ordering: Mutex<QueueOrdering>,
    handled_count: AtomicUsize,
    had_multiple_clients: AtomicBool,
    consistency_delay: Duration,
    store: Option<(Arc<dyn KeyValueStore>, String)>,
}

impl RequestQueue {
    /// Create an empty in-memory queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            ordering: Mutex::new(QueueOrdering::default()),
            handled_count: AtomicUsize::new(0),
            had_multiple_clients: AtomicBool::new(false),
            consistency_delay: API_PROCESSED_REQUESTS_DELAY,
            store: None,
        }
    }

    /// Create a queue that snapshots into `store` under `state_key`
    #[must_use]
    pub fn with_store(store: Arc<dyn KeyValueStore>, state_key: impl Into<String>) -> Self {
        let mut queue = Self::new();
        queue.store = Some((store, state_key.into()));
        queue
    }

    /// Mark that more than one client may be writing to the backing store
    ///
    /// Enables the consistency wait in [`RequestQueue::is_finished`].
    pub fn set_had_multiple_clients(&self, value: bool) {
        self.had_multiple_clients.store(value, Ordering::Release);
    }

    /// Whether the backing store has seen writes from multiple clients
    #[must_use]
    pub fn had_multiple_clients(&self) -> bool {
        self.had_multiple_clients.load(Ordering::Acquire)
    }

    /// Override the consistency delay (tests)
    #[cfg(test)]
    pub(crate) fn set_consistency_delay(&mut self, delay: Duration) {
        self.consistency_delay = delay;
    }

    /// Restore a previously persisted snapshot, if the store holds one
    ///
    /// Requests that were in progress at snapshot time are re-served
    /// before the pending tail.
    pub async fn initialize(&self) -> Result<(), SourceError> {
        let Some((store, key)) = &self.store else {
            return Ok(());
        };
        let state: Option<RequestQueueState> = crate::storage::get_json(store.as_ref(), key)
            .await
            .map_err(|e| SourceError::StorageUnavailable(e.to_string()))?;
        let Some(state) = state else {
            return Ok(());
        };

        let mut ordering = self.ordering.lock();
        self.requests.clear();
        *ordering = QueueOrdering::default();

        for request in state.requests {
            if let Some(id) = request.id.clone() {
                ordering
                    .by_unique_key
                    .insert(request.unique_key.clone(), id.clone());
                self.requests.insert(id, request);
            }
        }
        // In-flight requests at snapshot time come back first.
        for id in state.in_progress {
            ordering.pending.push_back(id);
        }
        for id in state.pending {
            ordering.pending.push_back(id);
        }
        for id in state.handled {
            ordering.handled.insert(id);
        }
        self.handled_count
            .store(ordering.handled.len(), Ordering::Release);
        debug!(
            "Request queue restored: {} pending, {} handled",
            ordering.pending.len(),
            ordering.handled.len()
        );
        Ok(())
    }

    /// Register a request, deduplicating by unique key
    ///
    /// An existing entry keeps its id, position and state; the returned
    /// info reports `was_already_present` together with the entry's
    /// current handled state. A fresh request gets a queue-assigned id
    /// and is inserted at the tail, or at the head when `forefront`.
    pub fn add_request(&self, mut request: Request, forefront: bool) -> QueueOperationInfo {
        let mut ordering = self.ordering.lock();

        if let Some(existing_id) = ordering.by_unique_key.get(&request.unique_key) {
            let existing_id = existing_id.clone();
            return QueueOperationInfo {
                was_already_handled: ordering.handled.contains(&existing_id),
                was_already_present: true,
                request_id: existing_id,
            };
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        request.id = Some(id.clone());
        ordering
            .by_unique_key
            .insert(request.unique_key.clone(), id.clone());
        if forefront {
            ordering.pending.push_front(id.clone());
        } else {
            ordering.pending.push_back(id.clone());
        }
        ordering.empty_head_since = None;
        self.requests.insert(id.clone(), request);

        QueueOperationInfo {
            request_id: id,
            was_already_present: false,
            was_already_handled: false,
        }
    }

    /// Requests currently pending
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.ordering.lock().pending.len()
    }

    /// Requests currently held by tasks
    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.ordering.lock().in_progress.len()
    }

    fn take_next(&self) -> Option<Request> {
        let mut ordering = self.ordering.lock();
        let id = ordering.pending.pop_front()?;
        ordering.in_progress.insert(id.clone());
        drop(ordering);
        self.requests.get(&id).map(|entry| entry.value().clone())
    }

    /// Classify an id that failed an in-progress check
    fn not_in_progress_error(&self, id: &str) -> SourceError {
        if self.requests.contains_key(id) {
            SourceError::NotInProgress { id: id.to_string() }
        } else {
            SourceError::UnknownRequest { id: id.to_string() }
        }
    }

    fn request_id(request: &Request) -> Result<String, SourceError> {
        request
            .id
            .clone()
            .ok_or_else(|| SourceError::MissingId {
                url: request.url.clone(),
            })
    }

    /// Snapshot the queue synchronously; the write happens afterwards
    fn snapshot(&self) -> RequestQueueState {
        let ordering = self.ordering.lock();
        let requests = self
            .requests
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        RequestQueueState {
            requests,
            pending: ordering.pending.iter().cloned().collect(),
            in_progress: ordering.in_progress.iter().cloned().collect(),
            handled: ordering.handled.iter().cloned().collect(),
        }
    }

    async fn persist_snapshot(&self, state: &RequestQueueState) -> Result<(), SourceError> {
        let Some((store, key)) = &self.store else {
            return Ok(());
        };
        let mut delay = PERSIST_BACKOFF;
        let mut last_error = None;
        for attempt in 1..=PERSIST_MAX_ATTEMPTS {
            match crate::storage::set_json(store.as_ref(), key, state).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Request queue persistence attempt {attempt}/{PERSIST_MAX_ATTEMPTS} failed: {e}"
                    );
                    last_error = Some(e);
                    if attempt < PERSIST_MAX_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(SourceError::StorageUnavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestSource for RequestQueue {
    async fn fetch_next_request(&self) -> Result<Option<Request>, SourceError> {
        Ok(self.take_next())
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<(), SourceError> {
        let id = Self::request_id(request)?;
        let mut ordering = self.ordering.lock();
        if !ordering.in_progress.remove(&id) {
            drop(ordering);
            return Err(self.not_in_progress_error(&id));
        }
        if forefront {
            ordering.pending.push_front(id.clone());
        } else {
            ordering.pending.push_back(id.clone());
        }
        ordering.empty_head_since = None;
        drop(ordering);
        // Keep the mutated retry counter and error trail.
        self.requests.insert(id, request.clone());
        Ok(())
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), SourceError> {
        let id = Self::request_id(request)?;
        let mut ordering = self.ordering.lock();
        if !ordering.in_progress.remove(&id) {
            drop(ordering);
            return Err(self.not_in_progress_error(&id));
        }
        ordering.handled.insert(id.clone());
        drop(ordering);
        self.requests.insert(id, request.clone());
        self.handled_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool, SourceError> {
        Ok(self.ordering.lock().pending.is_empty())
    }

    async fn is_finished(&self) -> Result<bool, SourceError> {
        let mut ordering = self.ordering.lock();
        if !ordering.pending.is_empty() || !ordering.in_progress.is_empty() {
            ordering.empty_head_since = None;
            return Ok(false);
        }
        if !self.had_multiple_clients() {
            return Ok(true);
        }
        // Another client's writes may still be propagating; only report
        // finished after the head stayed empty across the delay.
        match ordering.empty_head_since {
            Some(first_seen) if first_seen.elapsed() >= self.consistency_delay => Ok(true),
            Some(_) => Ok(false),
            None => {
                ordering.empty_head_since = Some(Instant::now());
                Ok(false)
            }
        }
    }

    fn handled_count(&self) -> usize {
        self.handled_count.load(Ordering::Acquire)
    }

    async fn persist_state(&self) -> Result<(), SourceError> {
        let state = self.snapshot();
        self.persist_snapshot(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_request_deduplicates_by_unique_key() {
        let queue = RequestQueue::new();
        let first = queue.add_request(Request::new("https://example.com/a"), false);
        assert!(!first.was_already_present);

        let duplicate = queue.add_request(Request::new("https://example.com/a/"), false);
        assert!(duplicate.was_already_present);
        assert!(!duplicate.was_already_handled);
        assert_eq!(duplicate.request_id, first.request_id);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_handled_requires_in_progress() {
        let queue = RequestQueue::new();
        queue.add_request(Request::new("https://example.com/a"), false);

        let fetched = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request should be pending");
        queue
            .mark_request_handled(&fetched)
            .await
            .expect("handled once");

        let err = queue
            .mark_request_handled(&fetched)
            .await
            .expect_err("second mark must fail");
        assert!(matches!(err, SourceError::NotInProgress { .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_rejected() {
        let queue = RequestQueue::new();
        let mut ghost = Request::new("https://example.com/ghost");
        ghost.id = Some("nope".to_string());
        let err = queue
            .mark_request_handled(&ghost)
            .await
            .expect_err("ghost request must be rejected");
        assert!(matches!(err, SourceError::UnknownRequest { .. }));
    }

    #[tokio::test]
    async fn test_forefront_reclaim_served_first() {
        let queue = RequestQueue::new();
        queue.add_request(Request::new("https://example.com/1"), false);
        queue.add_request(Request::new("https://example.com/2"), false);

        let first = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("pending");
        assert_eq!(first.url, "https://example.com/1");
        queue
            .reclaim_request(&first, true)
            .await
            .expect("reclaim to forefront");

        let again = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("pending");
        assert_eq!(again.url, "https://example.com/1");
    }

    #[tokio::test]
    async fn test_is_finished_waits_for_consistency_with_multiple_clients() {
        let mut queue = RequestQueue::new();
        queue.set_consistency_delay(Duration::from_millis(50));
        queue.set_had_multiple_clients(true);

        assert!(!queue.is_finished().await.expect("first observation"));
        assert!(!queue.is_finished().await.expect("still within delay"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(queue.is_finished().await.expect("after delay"));
    }

    #[tokio::test]
    async fn test_single_client_finishes_immediately() {
        let queue = RequestQueue::new();
        assert!(queue.is_finished().await.expect("empty queue"));
    }
}
