//! Session pool rotation and persistence walkthrough.
//!
//! Run with: cargo run --example session_rotation

use kodegen_crawl_scheduler::session::{SessionConfig, SessionPool, SessionPoolConfig};
use kodegen_crawl_scheduler::storage::MemoryKeyValueStore;

use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = Arc::new(MemoryKeyValueStore::new());
    let pool = Arc::new(
        SessionPool::new(SessionPoolConfig {
            max_pool_size: 10,
            session_config: SessionConfig {
                max_usage_count: 3,
                max_error_score: 2.0,
                ..SessionConfig::default()
            },
            ..SessionPoolConfig::default()
        })
        .with_store(store.clone()),
    );
    pool.initialize(None).await?;

    // Simulate a burst of work with mixed outcomes.
    for round in 0..30 {
        let session = pool.get_session();
        if round % 4 == 0 {
            session.mark_bad();
        } else {
            session.mark_good();
        }
        if round % 10 == 9 {
            // A blocked response burns the session outright.
            let retired = session.retire_on_blocked_status_codes(429);
            log::info!("session {} blocked-retired: {retired}", session.id());
        }
    }

    println!(
        "population {}: {} usable, {} retired",
        pool.size(),
        pool.usable_sessions_count(),
        pool.retired_sessions_count()
    );

    pool.teardown().await;

    // A fresh pool over the same store resumes with the usable survivors.
    let restored = Arc::new(
        SessionPool::new(SessionPoolConfig {
            max_pool_size: 10,
            ..SessionPoolConfig::default()
        })
        .with_store(store),
    );
    restored.initialize(None).await?;
    println!("restored {} usable sessions", restored.size());
    Ok(())
}
