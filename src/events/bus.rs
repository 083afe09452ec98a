//! Event bus implementation for publishing and subscribing to scheduler events
//!
//! Each crawler owns its own `EventBus` instance; there is no process-wide
//! singleton. Subscriptions are plain `broadcast::Receiver`s, so dropping
//! the receiver detaches the subscriber.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::errors::EventBusError;
use super::types::{EventBusMetricsSnapshot, SchedulerEvent};

/// Default buffer size for the broadcast channel
const DEFAULT_CAPACITY: usize = 256;

/// Event bus for publishing and subscribing to scheduler events
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    shutdown_flag: AtomicBool,
    /// Handle to the periodic `PersistState` tick task, if started
    persist_ticker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the specified capacity
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of events that can be buffered per subscriber
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            shutdown_flag: AtomicBool::new(false),
            persist_ticker: Mutex::new(None),
        }
    }

    /// Subscribe to all events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream` of events
    ///
    /// Lagged subscribers observe `BroadcastStreamRecvError` items instead
    /// of silently losing their place.
    #[must_use]
    pub fn stream(&self) -> tokio_stream::wrappers::BroadcastStream<SchedulerEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.sender.subscribe())
    }

    /// Number of currently attached subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received the event. An event
    /// published with no subscribers attached is counted as dropped but is
    /// not an error for lifecycle events, so callers that don't care can
    /// ignore the result.
    pub fn emit(&self, event: SchedulerEvent) -> Result<usize, EventBusError> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return Err(EventBusError::Shutdown);
        }
        match self.sender.send(event) {
            Ok(subscriber_count) => {
                self.events_published.fetch_add(1, Ordering::Relaxed);
                Ok(subscriber_count)
            }
            Err(_) => {
                self.events_published.fetch_add(1, Ordering::Relaxed);
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Published event but no active subscribers");
                Err(EventBusError::NoSubscribers)
            }
        }
    }

    /// Start emitting periodic `PersistState` ticks
    ///
    /// The tick task runs until [`EventBus::shutdown`]. Calling this twice
    /// replaces the previous ticker.
    pub fn start_periodic_persistence(self: &Arc<Self>, interval: Duration) {
        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so components do
            // not persist an empty initial state.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if bus.shutdown_flag.load(Ordering::Acquire) {
                    break;
                }
                let _ = bus.emit(SchedulerEvent::persist_state(false));
            }
        });
        let previous = self.persist_ticker.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Consistent snapshot of the bus counters
    #[must_use]
    pub fn metrics(&self) -> EventBusMetricsSnapshot {
        EventBusMetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }

    /// Whether [`EventBus::shutdown`] has been called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    /// Broadcast a final `Shutdown` event and stop the tick task
    ///
    /// Subsequent `emit` calls fail with [`EventBusError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.sender.send(SchedulerEvent::shutdown());
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(handle) = self.persist_ticker.lock().take() {
            handle.abort();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(handle) = self.persist_ticker.lock().take() {
            handle.abort();
        }
    }
}
