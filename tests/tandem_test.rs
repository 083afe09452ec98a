use kodegen_crawl_scheduler::sources::request_list::{RequestList, RequestListSource};
use kodegen_crawl_scheduler::sources::request_queue::RequestQueue;
use kodegen_crawl_scheduler::{Request, RequestSource, SourceTandem};

use std::collections::HashSet;
use std::sync::Arc;

async fn seeded_list(count: u32) -> Arc<RequestList> {
    let sources = (1..=count)
        .map(|n| RequestListSource::url(format!("https://example.com/{n}")))
        .collect();
    let list = Arc::new(RequestList::new(sources));
    list.initialize().await.expect("initialize");
    list
}

#[tokio::test]
async fn test_every_seed_ends_in_queue_handled_set() {
    let list = seeded_list(5).await;
    let queue = Arc::new(RequestQueue::new());
    let tandem = SourceTandem::new(list.clone(), queue.clone());

    let mut dispatched = Vec::new();
    while let Some(request) = tandem.fetch_next_request().await.expect("fetch") {
        dispatched.push(request.unique_key.clone());
        tandem.mark_request_handled(&request).await.expect("handle");
    }
    assert!(tandem.is_finished().await.expect("finished check"));

    // No seed is dispatched twice and none is lost.
    let unique: HashSet<&String> = dispatched.iter().collect();
    assert_eq!(unique.len(), dispatched.len());
    assert_eq!(dispatched.len(), 5);
    assert_eq!(queue.handled_count(), 5);
    assert!(list.is_finished().await.expect("list finished"));
}

#[tokio::test]
async fn test_list_order_preserved_over_queued_tails() {
    let list = seeded_list(2).await;
    let queue = Arc::new(RequestQueue::new());
    // A tail request queued before the crawl begins.
    queue.add_request(Request::new("https://example.com/queued-tail"), false);
    let tandem = SourceTandem::new(list, queue);

    let mut urls = Vec::new();
    while let Some(request) = tandem.fetch_next_request().await.expect("fetch") {
        urls.push(request.url.clone());
        tandem.mark_request_handled(&request).await.expect("handle");
    }

    // List items transfer at forefront, so they outrank the older tail.
    assert_eq!(
        urls,
        vec![
            "https://example.com/1",
            "https://example.com/2",
            "https://example.com/queued-tail",
        ]
    );
}

#[tokio::test]
async fn test_reclaimed_request_served_again_before_finish() {
    let list = seeded_list(2).await;
    let queue = Arc::new(RequestQueue::new());
    let tandem = SourceTandem::new(list, queue);

    let first = tandem
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("request");
    tandem
        .reclaim_request(&first, true)
        .await
        .expect("reclaim to forefront");

    let again = tandem
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("request");
    assert_eq!(again.unique_key, first.unique_key);
    assert!(!tandem.is_finished().await.expect("still in progress"));
}

#[tokio::test]
async fn test_duplicate_seed_and_queue_entry_collapse() {
    let list = seeded_list(2).await;
    let queue = Arc::new(RequestQueue::new());
    // Same unique key as the first list seed, already in the queue.
    queue.add_request(Request::new("https://example.com/1"), false);
    let tandem = SourceTandem::new(list, queue.clone());

    let mut urls = Vec::new();
    while let Some(request) = tandem.fetch_next_request().await.expect("fetch") {
        urls.push(request.url.clone());
        tandem.mark_request_handled(&request).await.expect("handle");
    }
    assert_eq!(urls.len(), 2, "duplicate entries must collapse");
    assert_eq!(queue.handled_count(), 2);
}
