//! List + queue tandem
//!
//! Composes a [`RequestList`] and a [`RequestQueue`] behind the single
//! [`RequestSource`] surface. List items are transferred into the queue
//! at forefront before the list marks them handled, so a crash between
//! the two steps leaves at worst a duplicate queue entry, never a lost
//! URL.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use super::request_list::RequestList;
use super::request_queue::RequestQueue;
use super::{RequestSource, SourceError};
use crate::request::Request;

/// A list feeding a queue, exposed as one source
pub struct SourceTandem {
    list: Option<Arc<RequestList>>,
    queue: Arc<RequestQueue>,
}

impl SourceTandem {
    /// Compose a list and a queue
    #[must_use]
    pub fn new(list: Arc<RequestList>, queue: Arc<RequestQueue>) -> Self {
        Self {
            list: Some(list),
            queue,
        }
    }

    /// Queue-only tandem, for callers that add requests dynamically
    #[must_use]
    pub fn queue_only(queue: Arc<RequestQueue>) -> Self {
        Self { list: None, queue }
    }

    /// The underlying queue
    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Pull one item off the list and hand it to the queue
    ///
    /// Returns the fetched queue request if the transfer produced one.
    async fn transfer_from_list(
        &self,
        list: &Arc<RequestList>,
        list_request: Request,
    ) -> Result<Option<Request>, SourceError> {
        // Forefront keeps the list's FIFO order ahead of older queue tails.
        let info = self.queue.add_request(list_request.clone(), true);
        if info.was_already_present {
            // The queue has seen this key before; the list entry is still
            // consumed below so the seed is not served twice.
            log::debug!(
                "List seed '{}' already known to the queue",
                list_request.unique_key
            );
        }

        let (fetched, marked) = tokio::join!(
            self.queue.fetch_next_request(),
            list.mark_request_handled(&list_request),
        );
        if let Err(e) = marked {
            // The request is safely in the queue; the list entry will be
            // re-served after a restart and deduplicated by the queue.
            warn!(
                "Failed to mark list seed '{}' handled after transfer: {e}",
                list_request.unique_key
            );
        }
        fetched
    }
}

#[async_trait]
impl RequestSource for SourceTandem {
    async fn fetch_next_request(&self) -> Result<Option<Request>, SourceError> {
        let Some(list) = &self.list else {
            return self.queue.fetch_next_request().await;
        };

        match list.fetch_next_request().await? {
            Some(list_request) => {
                match self.transfer_from_list(list, list_request.clone()).await {
                    Ok(fetched) => Ok(fetched),
                    Err(e) => {
                        warn!(
                            "Queue insert failed for list seed '{}', reclaiming to list: {e}",
                            list_request.unique_key
                        );
                        list.reclaim_request(&list_request, false).await?;
                        Ok(None)
                    }
                }
            }
            None => self.queue.fetch_next_request().await,
        }
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<(), SourceError> {
        // Served requests always come from the queue.
        self.queue.reclaim_request(request, forefront).await
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), SourceError> {
        self.queue.mark_request_handled(request).await
    }

    async fn is_empty(&self) -> Result<bool, SourceError> {
        if let Some(list) = &self.list
            && !list.is_empty().await?
        {
            return Ok(false);
        }
        self.queue.is_empty().await
    }

    async fn is_finished(&self) -> Result<bool, SourceError> {
        if let Some(list) = &self.list
            && !list.is_finished().await?
        {
            return Ok(false);
        }
        self.queue.is_finished().await
    }

    fn handled_count(&self) -> usize {
        self.queue.handled_count()
    }

    async fn persist_state(&self) -> Result<(), SourceError> {
        if let Some(list) = &self.list {
            let (list_result, queue_result) =
                tokio::join!(list.persist_state(), self.queue.persist_state());
            list_result?;
            queue_result
        } else {
            self.queue.persist_state().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::request_list::RequestListSource;

    async fn seeded_list(urls: &[&str]) -> Arc<RequestList> {
        let sources = urls.iter().map(|u| RequestListSource::url(*u)).collect();
        let list = Arc::new(RequestList::new(sources));
        list.initialize().await.expect("initialize");
        list
    }

    #[tokio::test]
    async fn test_list_items_flow_through_queue() {
        let list = seeded_list(&["https://example.com/1", "https://example.com/2"]).await;
        let queue = Arc::new(RequestQueue::new());
        let tandem = SourceTandem::new(list.clone(), queue.clone());

        let first = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request");
        assert_eq!(first.url, "https://example.com/1");
        assert!(first.id.is_some(), "served request must carry a queue id");
        assert_eq!(list.handled_count(), 1);

        tandem.mark_request_handled(&first).await.expect("handle");
        assert_eq!(tandem.handled_count(), 1);
    }

    #[tokio::test]
    async fn test_finishes_only_when_both_components_finish() {
        let list = seeded_list(&["https://example.com/1"]).await;
        let queue = Arc::new(RequestQueue::new());
        let tandem = SourceTandem::new(list, queue);

        assert!(!tandem.is_finished().await.expect("list still has seeds"));
        let request = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request");
        assert!(
            !tandem.is_finished().await.expect("request in progress"),
            "queue still has the request in progress"
        );
        tandem.mark_request_handled(&request).await.expect("handle");
        assert!(tandem.is_finished().await.expect("all drained"));
    }

    #[tokio::test]
    async fn test_queue_only_passthrough() {
        let queue = Arc::new(RequestQueue::new());
        queue.add_request(Request::new("https://example.com/q"), false);
        let tandem = SourceTandem::queue_only(queue);

        let request = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request");
        assert_eq!(request.url, "https://example.com/q");
    }
}
