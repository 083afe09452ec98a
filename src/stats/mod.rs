//! Crawl run statistics
//!
//! Tracks per-job timing, outcome counters and a histogram of retry
//! counts, logs a periodic summary line, and persists its aggregates so a
//! migrated run keeps counting where it left off.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::events::{EventBus, SchedulerEvent};
use crate::storage::{KeyValueStore, STATISTICS_STATE_KEY_PREFIX};

/// Timing record for one job (one request id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub first_started_at: DateTime<Utc>,
    pub last_started_at: DateTime<Utc>,
    /// Attempts so far, including the first
    pub runs: u32,
}

/// Persisted statistics record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsState {
    pub finished_jobs: u64,
    pub failed_jobs: u64,
    pub total_job_duration_millis: u64,
    /// Index = retry count at job completion
    pub job_retry_histogram: Vec<u64>,
    pub started_at: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Aggregates {
    finished_jobs: u64,
    failed_jobs: u64,
    min_duration_millis: Option<u64>,
    max_duration_millis: u64,
    total_duration_millis: u64,
    retry_histogram: Vec<u64>,
}

impl Aggregates {
    fn record_retries(&mut self, retry_count: usize) {
        if self.retry_histogram.len() <= retry_count {
            self.retry_histogram.resize(retry_count + 1, 0);
        }
        self.retry_histogram[retry_count] += 1;
    }
}

/// Read-only snapshot for log lines and assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub finished_jobs: u64,
    pub failed_jobs: u64,
    pub min_duration_millis: Option<u64>,
    pub max_duration_millis: u64,
    pub total_duration_millis: u64,
    pub retry_histogram: Vec<u64>,
}

impl StatisticsSnapshot {
    /// Mean duration of finished jobs, zero when none finished
    #[must_use]
    pub fn avg_duration_millis(&self) -> u64 {
        if self.finished_jobs == 0 {
            0
        } else {
            self.total_duration_millis / self.finished_jobs
        }
    }
}

/// Per-run statistics tracker
pub struct Statistics {
    /// Distinguishes multiple trackers persisting into the same store
    instance: usize,
    started_at: Mutex<DateTime<Utc>>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    aggregates: Mutex<Aggregates>,
    store: Option<Arc<dyn KeyValueStore>>,
    persist_listener: Mutex<Option<JoinHandle<()>>>,
    log_ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Statistics {
    /// Create tracker number `instance`
    #[must_use]
    pub fn new(instance: usize) -> Self {
        Self {
            instance,
            started_at: Mutex::new(Utc::now()),
            jobs: Mutex::new(HashMap::new()),
            aggregates: Mutex::new(Aggregates::default()),
            store: None,
            persist_listener: Mutex::new(None),
            log_ticker: Mutex::new(None),
        }
    }

    /// Persist into `store` under `STATISTICS_STATE_<instance>`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn state_key(&self) -> String {
        format!("{STATISTICS_STATE_KEY_PREFIX}{}", self.instance)
    }

    /// Restore persisted aggregates and attach to the event bus
    pub async fn initialize(self: &Arc<Self>, bus: Option<&Arc<EventBus>>) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            let state: Option<StatisticsState> =
                crate::storage::get_json(store.as_ref(), &self.state_key()).await?;
            if let Some(state) = state {
                let mut aggregates = self.aggregates.lock();
                aggregates.finished_jobs = state.finished_jobs;
                aggregates.failed_jobs = state.failed_jobs;
                aggregates.total_duration_millis = state.total_job_duration_millis;
                aggregates.retry_histogram = state.job_retry_histogram;
                *self.started_at.lock() = state.started_at;
                info!(
                    "Statistics restored: {} finished, {} failed so far",
                    state.finished_jobs, state.failed_jobs
                );
            }
        }

        if let Some(bus) = bus {
            let mut receiver = bus.subscribe();
            let stats = Arc::clone(self);
            let listener = tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(SchedulerEvent::PersistState { .. }) => {
                            if let Err(e) = stats.persist_state().await {
                                warn!("Statistics persistence failed: {e}");
                            }
                        }
                        Ok(SchedulerEvent::Shutdown { .. })
                        | Err(broadcast::error::RecvError::Closed) => break,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            });
            let previous = self.persist_listener.lock().replace(listener);
            if let Some(previous) = previous {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Log a summary line every `interval` until [`Statistics::teardown`]
    pub fn start_periodic_logging(self: &Arc<Self>, interval: Duration) {
        let stats = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_summary();
            }
        });
        let previous = self.log_ticker.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Record an attempt starting for `job_id`
    pub fn start_job(&self, job_id: &str) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();
        jobs.entry(job_id.to_string())
            .and_modify(|record| {
                record.runs += 1;
                record.last_started_at = now;
            })
            .or_insert(JobRecord {
                first_started_at: now,
                last_started_at: now,
                runs: 1,
            });
    }

    /// Record `job_id` finishing successfully
    pub fn finish_job(&self, job_id: &str) {
        let Some(record) = self.jobs.lock().remove(job_id) else {
            return;
        };
        let duration_millis = (Utc::now() - record.last_started_at)
            .num_milliseconds()
            .max(0) as u64;
        let mut aggregates = self.aggregates.lock();
        aggregates.finished_jobs += 1;
        aggregates.total_duration_millis += duration_millis;
        aggregates.max_duration_millis = aggregates.max_duration_millis.max(duration_millis);
        aggregates.min_duration_millis = Some(
            aggregates
                .min_duration_millis
                .map_or(duration_millis, |m| m.min(duration_millis)),
        );
        aggregates.record_retries((record.runs - 1) as usize);
    }

    /// Record `job_id` failing terminally
    pub fn fail_job(&self, job_id: &str) {
        let Some(record) = self.jobs.lock().remove(job_id) else {
            return;
        };
        let mut aggregates = self.aggregates.lock();
        aggregates.failed_jobs += 1;
        aggregates.record_retries((record.runs - 1) as usize);
    }

    /// Current aggregates
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let aggregates = self.aggregates.lock();
        StatisticsSnapshot {
            finished_jobs: aggregates.finished_jobs,
            failed_jobs: aggregates.failed_jobs,
            min_duration_millis: aggregates.min_duration_millis,
            max_duration_millis: aggregates.max_duration_millis,
            total_duration_millis: aggregates.total_duration_millis,
            retry_histogram: aggregates.retry_histogram.clone(),
        }
    }

    fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            "Crawler statistics: {} finished, {} failed, avg duration {}ms, retry histogram {:?}",
            snapshot.finished_jobs,
            snapshot.failed_jobs,
            snapshot.avg_duration_millis(),
            snapshot.retry_histogram
        );
    }

    /// Write the current aggregates to the KV store
    pub async fn persist_state(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        // Snapshot synchronously before the write.
        let snapshot = self.snapshot();
        let state = StatisticsState {
            finished_jobs: snapshot.finished_jobs,
            failed_jobs: snapshot.failed_jobs,
            total_job_duration_millis: snapshot.total_duration_millis,
            job_retry_histogram: snapshot.retry_histogram,
            started_at: *self.started_at.lock(),
            persisted_at: Utc::now(),
        };
        crate::storage::set_json(store.as_ref(), &self.state_key(), &state).await?;
        Ok(())
    }

    /// Stop background tasks and write one final snapshot
    pub async fn teardown(&self) {
        if let Some(listener) = self.persist_listener.lock().take() {
            listener.abort();
        }
        if let Some(ticker) = self.log_ticker.lock().take() {
            ticker.abort();
        }
        if let Err(e) = self.persist_state().await {
            warn!("Final statistics persistence failed: {e}");
        }
    }
}

impl Drop for Statistics {
    fn drop(&mut self) {
        if let Some(listener) = self.persist_listener.lock().take() {
            listener.abort();
        }
        if let Some(ticker) = self.log_ticker.lock().take() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    #[tokio::test]
    async fn test_finish_counts_and_histogram() {
        let stats = Statistics::new(0);
        stats.start_job("a");
        stats.finish_job("a");
        stats.start_job("b");
        stats.start_job("b");
        stats.start_job("b");
        stats.finish_job("b");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.finished_jobs, 2);
        assert_eq!(snapshot.failed_jobs, 0);
        // "a" finished with 0 retries, "b" with 2.
        assert_eq!(snapshot.retry_histogram, vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn test_fail_counts_without_duration() {
        let stats = Statistics::new(0);
        stats.start_job("a");
        stats.fail_job("a");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.finished_jobs, 0);
        assert_eq!(snapshot.total_duration_millis, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_ignored() {
        let stats = Statistics::new(0);
        stats.finish_job("never-started");
        assert_eq!(stats.snapshot().finished_jobs, 0);
    }

    #[tokio::test]
    async fn test_persist_restore_continues_counting() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let stats = Arc::new(Statistics::new(7).with_store(store.clone()));
        stats.initialize(None).await.expect("initialize");
        stats.start_job("a");
        stats.finish_job("a");
        stats.persist_state().await.expect("persist");

        let resumed = Arc::new(Statistics::new(7).with_store(store));
        resumed.initialize(None).await.expect("restore");
        resumed.start_job("b");
        resumed.fail_job("b");

        let snapshot = resumed.snapshot();
        assert_eq!(snapshot.finished_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
    }
}
