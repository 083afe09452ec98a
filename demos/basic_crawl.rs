//! Minimal end-to-end crawl over an in-memory queue.
//!
//! Run with: cargo run --example basic_crawl

use kodegen_crawl_scheduler::autoscaling::AutoscaledPoolConfig;
use kodegen_crawl_scheduler::sources::request_queue::RequestQueue;
use kodegen_crawl_scheduler::{BasicCrawler, BasicCrawlerConfig, Request};

use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let queue = Arc::new(RequestQueue::new());
    for n in 1..=20 {
        queue.add_request(Request::new(format!("https://example.com/page/{n}")), false);
    }

    let config = BasicCrawlerConfig {
        max_requests_per_crawl: Some(15),
        pool: AutoscaledPoolConfig {
            min_concurrency: 2,
            max_concurrency: 8,
            maybe_run_interval: Duration::from_millis(50),
            autoscale_interval: Duration::from_secs(1),
            ..AutoscaledPoolConfig::default()
        },
        ..BasicCrawlerConfig::default()
    };

    let crawler = Arc::new(BasicCrawler::new(
        queue,
        Arc::new(|context| {
            Box::pin(async move {
                log::info!("processing {}", context.url());
                // Stand-in for real fetching and extraction work.
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
        }),
        config,
    ));

    crawler.run().await?;

    let snapshot = crawler.stats().snapshot();
    println!(
        "processed {} requests ({} failed), avg {}ms",
        snapshot.finished_jobs,
        snapshot.failed_jobs,
        snapshot.avg_duration_millis()
    );
    Ok(())
}
