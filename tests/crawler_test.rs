use kodegen_crawl_scheduler::autoscaling::AutoscaledPoolConfig;
use kodegen_crawl_scheduler::crawler::{FailedRequestHandler, RequestHandler};
use kodegen_crawl_scheduler::sources::request_list::{RequestList, RequestListSource};
use kodegen_crawl_scheduler::sources::request_queue::RequestQueue;
use kodegen_crawl_scheduler::{
    BasicCrawler, BasicCrawlerConfig, CrawlingContext, EventBus, MemoryKeyValueStore, Request,
    RequestSource, SchedulerEvent, Statistics,
};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(CrawlingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context| Box::pin(f(context)))
}

fn failed_handler<F>(f: F) -> FailedRequestHandler
where
    F: Fn(Request, anyhow::Error) + Send + Sync + 'static,
{
    Arc::new(move |request, error| {
        f(request, error);
        Box::pin(async { Ok(()) })
    })
}

fn fast_config(concurrency: usize) -> BasicCrawlerConfig {
    BasicCrawlerConfig {
        pool: AutoscaledPoolConfig {
            min_concurrency: concurrency,
            max_concurrency: concurrency,
            maybe_run_interval: Duration::from_millis(5),
            autoscale_interval: Duration::from_millis(100),
            logging_interval: Duration::from_secs(3600),
            ..AutoscaledPoolConfig::default()
        },
        ..BasicCrawlerConfig::default()
    }
}

async fn seeded_list(urls: &[String]) -> Arc<RequestList> {
    let sources = urls
        .iter()
        .map(|u| RequestListSource::url(u.clone()))
        .collect();
    let list = Arc::new(RequestList::new(sources));
    list.initialize().await.expect("initialize");
    list
}

#[tokio::test]
async fn test_happy_path_processes_six_urls_in_order() {
    let urls: Vec<String> = (1..=6).map(|n| format!("https://example.com/?q={n}")).collect();
    let list = seeded_list(&urls).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_sink = Arc::clone(&order);
    let crawler = Arc::new(BasicCrawler::new(
        list.clone(),
        handler(move |context| {
            let order = Arc::clone(&order_sink);
            async move {
                order.lock().push(context.url());
                Ok(())
            }
        }),
        fast_config(1),
    ));

    crawler.run().await.expect("crawl should complete");

    assert_eq!(*order.lock(), urls);
    assert_eq!(crawler.handled_count(), 6);
    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.finished_jobs, 6);
    assert_eq!(snapshot.failed_jobs, 0);
    assert!(list.is_finished().await.expect("finished"));
}

#[tokio::test]
async fn test_retry_then_fail_records_full_error_trail() {
    let queue = Arc::new(RequestQueue::new());
    queue.add_request(Request::new("https://example.com/flaky"), false);

    let failures = Arc::new(AtomicUsize::new(0));
    let captured: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
    let failures_sink = Arc::clone(&failures);
    let captured_sink = Arc::clone(&captured);

    let crawler = Arc::new(
        BasicCrawler::new(
            queue.clone(),
            handler(|_context| async { Err(anyhow::anyhow!("handler exploded")) }),
            fast_config(1),
        )
        .with_failed_request_handler(failed_handler(move |request, _error| {
            failures_sink.fetch_add(1, Ordering::AcqRel);
            *captured_sink.lock() = Some(request);
        })),
    );

    crawler.run().await.expect("crawl completes despite failures");

    assert_eq!(failures.load(Ordering::Acquire), 1);
    let request = captured.lock().take().expect("failed request captured");
    // One initial attempt plus three retries.
    assert_eq!(request.error_messages.len(), 4);
    assert!(request.error_messages[0].contains("handler exploded"));
    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.failed_jobs, 1);
    assert_eq!(snapshot.finished_jobs, 0);
    assert!(queue.is_finished().await.expect("finished"));
}

#[tokio::test]
async fn test_no_retry_request_fails_after_single_attempt() {
    let queue = Arc::new(RequestQueue::new());
    queue.add_request(Request::new("https://example.com/once").no_retry(), false);

    let attempts = Arc::new(AtomicUsize::new(0));
    let captured: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
    let attempts_sink = Arc::clone(&attempts);
    let captured_sink = Arc::clone(&captured);

    let crawler = Arc::new(
        BasicCrawler::new(
            queue,
            handler(move |_context| {
                attempts_sink.fetch_add(1, Ordering::AcqRel);
                async { Err(anyhow::anyhow!("always fails")) }
            }),
            fast_config(1),
        )
        .with_failed_request_handler(failed_handler(move |request, _error| {
            *captured_sink.lock() = Some(request);
        })),
    );

    crawler.run().await.expect("crawl completes");

    assert_eq!(attempts.load(Ordering::Acquire), 1);
    let request = captured.lock().take().expect("failed request captured");
    assert_eq!(request.error_messages.len(), 1);
}

#[tokio::test]
async fn test_exhausted_retry_budget_fails_on_next_throw() {
    let queue = Arc::new(RequestQueue::new());
    let mut request = Request::new("https://example.com/worn-out");
    request.retry_state.retry_count = 3;
    queue.add_request(request, false);

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_sink = Arc::clone(&attempts);
    let crawler = Arc::new(
        BasicCrawler::new(
            queue,
            handler(move |_context| {
                attempts_sink.fetch_add(1, Ordering::AcqRel);
                async { Err(anyhow::anyhow!("still failing")) }
            }),
            fast_config(1),
        )
        .with_failed_request_handler(failed_handler(|_request, _error| {})),
    );

    crawler.run().await.expect("crawl completes");
    assert_eq!(attempts.load(Ordering::Acquire), 1);
    assert_eq!(crawler.stats().snapshot().failed_jobs, 1);
}

#[tokio::test]
async fn test_throwing_failed_request_handler_aborts_crawl() {
    let queue = Arc::new(RequestQueue::new());
    queue.add_request(Request::new("https://example.com/doomed").no_retry(), false);

    let crawler = Arc::new(
        BasicCrawler::new(
            queue.clone(),
            handler(|_context| async { Err(anyhow::anyhow!("handler exploded")) }),
            fast_config(1),
        )
        .with_failed_request_handler(Arc::new(|_request, _error| {
            Box::pin(async { Err(anyhow::anyhow!("failure handler exploded")) })
        })),
    );

    let error = crawler
        .run()
        .await
        .expect_err("an error from the failure handler must abort the crawl");
    assert!(format!("{error:#}").contains("failure handler exploded"));
    // The request never reached a terminal state; its fate is unknown.
    assert_eq!(queue.handled_count(), 0);
    assert_eq!(crawler.handled_count(), 0);
}

#[tokio::test]
async fn test_crawl_cap_stops_launches() {
    let urls: Vec<String> = (1..=10).map(|n| format!("https://example.com/{n}")).collect();
    let list = seeded_list(&urls).await;

    let config = BasicCrawlerConfig {
        max_requests_per_crawl: Some(3),
        ..fast_config(1)
    };
    let crawler = Arc::new(BasicCrawler::new(
        list,
        handler(|_context| async { Ok(()) }),
        config,
    ));

    crawler.run().await.expect("capped crawl completes");
    assert_eq!(crawler.handled_count(), 3);
}

#[tokio::test]
async fn test_migration_persists_and_fresh_process_resumes() {
    let store = Arc::new(MemoryKeyValueStore::new());
    let urls: Vec<String> = (1..=4).map(|n| format!("https://example.com/{n}")).collect();

    let seeds = |urls: &[String]| {
        urls.iter()
            .map(|u| RequestListSource::url(u.clone()))
            .collect::<Vec<_>>()
    };

    let list = Arc::new(RequestList::new(seeds(&urls)).with_store(store.clone(), "LIST_STATE"));
    list.initialize().await.expect("initialize");

    let bus = Arc::new(EventBus::new());
    let bus_for_handler = Arc::clone(&bus);
    let first_url = urls[0].clone();
    let crawler = Arc::new(
        BasicCrawler::new(
            list,
            handler(move |context| {
                let bus = Arc::clone(&bus_for_handler);
                let first_url = first_url.clone();
                async move {
                    if context.url() == first_url {
                        // The host announces a migration mid-processing.
                        let _ = bus.emit(SchedulerEvent::migrating());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Ok(())
                }
            }),
            fast_config(1),
        )
        .with_event_bus(bus)
        .with_statistics(Arc::new(Statistics::new(0).with_store(store.clone()))),
    );

    let run = {
        let crawler = Arc::clone(&crawler);
        tokio::spawn(async move { crawler.run().await })
    };

    // Wait for the migration path to persist the list cursor.
    let mut persisted = None;
    for _ in 0..200 {
        let state: Option<kodegen_crawl_scheduler::sources::RequestListState> =
            kodegen_crawl_scheduler::storage::get_json(store.as_ref(), "LIST_STATE")
                .await
                .expect("state readable");
        if let Some(state) = state
            && state.handled_count >= 1
        {
            persisted = Some(state);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let state = persisted.expect("migration must persist list state");
    assert_eq!(state.handled_count, 1);
    assert!(state.in_progress.is_empty(), "pool drained before persist");

    // The host terminates the paused process.
    run.abort();

    // A fresh process picks up from the same keys.
    let resumed_list =
        Arc::new(RequestList::new(seeds(&urls)).with_store(store.clone(), "LIST_STATE"));
    resumed_list.initialize().await.expect("re-initialize");
    assert_eq!(resumed_list.handled_count(), 1);

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_sink = Arc::clone(&order);
    let resumed = Arc::new(
        BasicCrawler::new(
            resumed_list,
            handler(move |context| {
                let order = Arc::clone(&order_sink);
                async move {
                    order.lock().push(context.url());
                    Ok(())
                }
            }),
            fast_config(1),
        )
        .with_statistics(Arc::new(Statistics::new(0).with_store(store))),
    );
    resumed.run().await.expect("resumed crawl completes");

    assert_eq!(*order.lock(), urls[1..].to_vec());
    // Restored statistics keep counting across the migration.
    assert_eq!(resumed.stats().snapshot().finished_jobs, 4);
}
