//! Request sources
//!
//! Anything exposing the fetch/mark/reclaim contract is a source: a
//! finite [`RequestList`], a durable [`RequestQueue`], or the
//! [`SourceTandem`] that drains a list into a queue. The crawler is
//! source-agnostic and only talks to [`RequestSource`].

pub mod request_list;
pub mod request_queue;
pub mod tandem;
pub mod transport;

pub use request_list::{RequestList, RequestListSource, RequestListState};
pub use request_queue::{QueueOperationInfo, RequestQueue};
pub use tandem::SourceTandem;
pub use transport::{HttpTransport, Transport, TransportError, extract_urls_from_text};

use async_trait::async_trait;

use crate::request::Request;

/// Errors surfaced by request sources
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Mark/reclaim on a request the source is not currently dispatching
    #[error("Request '{id}' is not in progress")]
    NotInProgress { id: String },

    /// The source has never seen this request
    #[error("Unknown request '{id}'")]
    UnknownRequest { id: String },

    /// The request has no id yet, so it cannot be addressed
    #[error("Request for '{url}' has no id; was it fetched from this source?")]
    MissingId { url: String },

    /// The persistence layer gave up after bounded retries
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Downloading a remote seed file failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The source was used before `initialize()`
    #[error("Source not initialized")]
    NotInitialized,
}

/// The fetch/mark/reclaim contract shared by list, queue and tandem
#[async_trait]
pub trait RequestSource: Send + Sync {
    /// Take the next pending request, moving it to in-progress
    ///
    /// Returns `None` when nothing is pending right now; the caller is
    /// expected to probe again later, since in-progress requests may be
    /// reclaimed.
    async fn fetch_next_request(&self) -> Result<Option<Request>, SourceError>;

    /// Return an in-progress request to pending without handling it
    ///
    /// `forefront` requests the head of the pending order, so the next
    /// fetch serves this request first. Sources without a priority notion
    /// re-serve reclaimed requests before fresh ones regardless.
    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<(), SourceError>;

    /// Move an in-progress request to its terminal handled state
    async fn mark_request_handled(&self, request: &Request) -> Result<(), SourceError>;

    /// Whether nothing is pending (in-progress requests may still exist)
    async fn is_empty(&self) -> Result<bool, SourceError>;

    /// Whether nothing is pending and nothing is in progress
    async fn is_finished(&self) -> Result<bool, SourceError>;

    /// Number of requests in the handled state
    fn handled_count(&self) -> usize;

    /// Write a state snapshot to the backing store, if any
    async fn persist_state(&self) -> Result<(), SourceError>;
}
