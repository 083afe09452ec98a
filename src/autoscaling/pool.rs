//! Concurrency controller
//!
//! Single orchestrating loop: probe readiness, launch cooperative tasks
//! while below the desired concurrency, and adjust that desired level
//! from a window of load samples. Launched tasks run detached; the pool
//! only tracks their count, so a slot is freed the moment a task settles.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::system_status::{NoopSystemInfo, SystemInfoSource, SystemStatusTracker};

/// Boxed task future returned by the run-task hook
pub type BoxTaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
/// Boxed predicate future returned by the readiness/finished hooks
pub type BoxBoolFuture = Pin<Box<dyn Future<Output = Result<bool>> + Send>>;

/// The three closures the pool schedules around
#[derive(Clone)]
pub struct PoolHooks {
    /// Performs one unit of work
    pub run_task: Arc<dyn Fn() -> BoxTaskFuture + Send + Sync>,
    /// Whether a unit of work could start right now
    pub is_task_ready: Arc<dyn Fn() -> BoxBoolFuture + Send + Sync>,
    /// Whether the pool should stop once running tasks drain
    pub is_finished: Arc<dyn Fn() -> BoxBoolFuture + Send + Sync>,
}

/// Autoscaled pool configuration
#[derive(Debug, Clone)]
pub struct AutoscaledPoolConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Utilization (running / desired) above which the pool scales up
    pub desired_concurrency_ratio: f64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// How often the loop probes readiness
    pub maybe_run_interval: Duration,
    /// How often desired concurrency is recomputed
    pub autoscale_interval: Duration,
    pub logging_interval: Duration,
    /// Overloaded fraction of the sample window that forces a scale-down
    pub max_overloaded_ratio: f64,
    /// Deadline for a single task; `None` disables the wrapper
    pub task_timeout: Option<Duration>,
}

impl Default for AutoscaledPoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 1000,
            desired_concurrency_ratio: 0.90,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval: Duration::from_millis(500),
            autoscale_interval: Duration::from_secs(10),
            logging_interval: Duration::from_secs(60),
            max_overloaded_ratio: 0.2,
            task_timeout: None,
        }
    }
}

/// Pool-level task failure
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The per-task deadline fired
    #[error("Task timed out after {secs} seconds")]
    TaskTimeout { secs: u64 },
}

#[derive(Debug)]
struct PoolShared {
    running: AtomicUsize,
    desired: AtomicUsize,
    paused: AtomicBool,
    aborted: AtomicBool,
    fatal: Mutex<Option<anyhow::Error>>,
    /// Notified whenever `running` drops to zero
    drained: Notify,
    /// Notified on task completion so the loop re-probes promptly
    wake: Notify,
}

/// Cooperative scheduler that dials in-flight task count against load
pub struct AutoscaledPool {
    config: AutoscaledPoolConfig,
    hooks: PoolHooks,
    system: Arc<dyn SystemInfoSource>,
    tracker: Mutex<SystemStatusTracker>,
    shared: Arc<PoolShared>,
}

impl AutoscaledPool {
    /// Create a pool over the given hooks
    #[must_use]
    pub fn new(config: AutoscaledPoolConfig, hooks: PoolHooks) -> Self {
        let desired = config.min_concurrency.max(1);
        // Window holds one autoscale interval worth of ticks.
        let window = (config.autoscale_interval.as_millis()
            / config.maybe_run_interval.as_millis().max(1)) as usize;
        Self {
            config,
            hooks,
            system: Arc::new(NoopSystemInfo),
            tracker: Mutex::new(SystemStatusTracker::new(window.max(1))),
            shared: Arc::new(PoolShared {
                running: AtomicUsize::new(0),
                desired: AtomicUsize::new(desired),
                paused: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                fatal: Mutex::new(None),
                drained: Notify::new(),
                wake: Notify::new(),
            }),
        }
    }

    /// Replace the load probe
    #[must_use]
    pub fn with_system_info(mut self, system: Arc<dyn SystemInfoSource>) -> Self {
        self.system = system;
        self
    }

    /// Tasks currently in flight
    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Concurrency the pool is currently aiming for
    #[must_use]
    pub fn desired_concurrency(&self) -> usize {
        self.shared.desired.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    /// Feed an external CPU sample (host `CpuInfo` events)
    pub fn record_external_cpu_sample(&self, is_cpu_overloaded: bool) {
        self.tracker.lock().push(super::SystemSnapshot {
            cpu_overloaded: is_cpu_overloaded,
            memory_overloaded: false,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Run until the finished hook reports done and in-flight tasks drain
    ///
    /// A task error is fatal: the pool stops accepting work and `run`
    /// returns the error. In-flight tasks keep running detached; their
    /// results are discarded.
    pub async fn run(&self) -> Result<()> {
        info!(
            "AutoscaledPool started (concurrency {}..{})",
            self.config.min_concurrency, self.config.max_concurrency
        );
        let mut next_autoscale = Instant::now() + self.config.autoscale_interval;
        let mut next_log = Instant::now() + self.config.logging_interval;

        loop {
            if let Some(error) = self.shared.fatal.lock().take() {
                return Err(error);
            }

            let running = self.shared.running.load(Ordering::Acquire);
            if self.shared.aborted.load(Ordering::Acquire) {
                if running == 0 {
                    info!("AutoscaledPool aborted and drained");
                    return Ok(());
                }
            } else if !self.shared.paused.load(Ordering::Acquire) {
                if running == 0 && (self.hooks.is_finished)().await? {
                    info!("AutoscaledPool finished");
                    return Ok(());
                }
                self.maybe_launch_tasks().await?;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.maybe_run_interval) => {},
                () = self.shared.wake.notified() => {},
            }

            let snapshot = self.system.sample();
            let now = Instant::now();
            {
                let mut tracker = self.tracker.lock();
                tracker.push(snapshot);
                if now >= next_autoscale {
                    self.autoscale(&mut tracker);
                    next_autoscale = now + self.config.autoscale_interval;
                }
            }
            if now >= next_log {
                info!(
                    "AutoscaledPool state: running {}, desired {}, overloaded ratio {:.2}",
                    self.current_concurrency(),
                    self.desired_concurrency(),
                    self.tracker.lock().overloaded_ratio()
                );
                next_log = now + self.config.logging_interval;
            }
        }
    }

    /// Suppress new launches and wait for in-flight tasks to drain
    ///
    /// Returns whether the pool fully drained within `timeout`; a partial
    /// drain resolves anyway so migration can proceed.
    pub async fn pause(&self, timeout: Duration) -> bool {
        self.shared.paused.store(true, Ordering::Release);
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.shared.drained.notified();
                if self.shared.running.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                "Pool pause timed out with {} tasks still in flight",
                self.current_concurrency()
            );
        }
        drained
    }

    /// Allow launches again after [`AutoscaledPool::pause`]
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Stop accepting new tasks; in-flight tasks complete
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    async fn maybe_launch_tasks(&self) -> Result<()> {
        loop {
            let running = self.shared.running.load(Ordering::Acquire);
            let desired = self.shared.desired.load(Ordering::Acquire);
            if running >= desired
                || self.shared.paused.load(Ordering::Acquire)
                || self.shared.aborted.load(Ordering::Acquire)
            {
                return Ok(());
            }
            if !(self.hooks.is_task_ready)().await? {
                return Ok(());
            }
            self.launch_task();
        }
    }

    fn launch_task(&self) {
        let shared = Arc::clone(&self.shared);
        let task = (self.hooks.run_task)();
        let task_timeout = self.config.task_timeout;
        shared.running.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let result = match task_timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::Error::new(PoolError::TaskTimeout {
                        secs: limit.as_secs(),
                    })),
                },
                None => task.await,
            };

            // A missed deadline only frees the slot; the pool keeps
            // scheduling. Any other task error is fatal to the run.
            if let Err(error) = result {
                if error.is::<PoolError>() {
                    warn!("Pool task rejected: {error}");
                } else {
                    error!("Pool task failed: {error:#}");
                    let mut fatal = shared.fatal.lock();
                    if fatal.is_none() {
                        *fatal = Some(error);
                    }
                    shared.aborted.store(true, Ordering::Release);
                }
            }

            let remaining = shared.running.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 {
                shared.drained.notify_waiters();
            }
            shared.wake.notify_one();
        });
    }

    fn autoscale(&self, tracker: &mut SystemStatusTracker) {
        let running = self.shared.running.load(Ordering::Acquire);
        let desired = self.shared.desired.load(Ordering::Acquire);
        let overloaded_ratio = tracker.overloaded_ratio();

        let proposed = if overloaded_ratio > self.config.max_overloaded_ratio {
            desired.saturating_sub(Self::step(desired, self.config.scale_down_step_ratio))
        } else if running as f64 >= desired as f64 * self.config.desired_concurrency_ratio {
            desired + Self::step(desired, self.config.scale_up_step_ratio)
        } else {
            desired
        };

        let clamped = proposed.clamp(self.config.min_concurrency, self.config.max_concurrency);
        if clamped != desired {
            debug!(
                "AutoscaledPool scaled {desired} -> {clamped} (overloaded ratio {overloaded_ratio:.2}, running {running})"
            );
            self.shared.desired.store(clamped, Ordering::Release);
        }
        tracker.clear();
    }

    /// At least one, so small pools still move
    fn step(desired: usize, ratio: f64) -> usize {
        ((desired as f64 * ratio).ceil() as usize).max(1)
    }
}
