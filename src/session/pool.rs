//! Rotating session pool
//!
//! Bounded population of sessions with random rotation, eviction of
//! unusable sessions, KV persistence and event-bus driven snapshots.
//! Lifecycle notifications (a session being discarded) are emitted by the
//! pool, never by sessions themselves, so sessions stay free of back
//! references.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::session::{Session, SessionConfig, SessionState};
use crate::events::{EventBus, SchedulerEvent};
use crate::storage::{KeyValueStore, SESSION_POOL_STATE_KEY};

/// Factory producing fresh sessions for the pool
pub type SessionFactory = Arc<dyn Fn(&SessionConfig) -> Session + Send + Sync>;

/// Session pool configuration
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Hard cap on the population
    pub max_pool_size: usize,
    /// Config handed to the factory for every new session
    pub session_config: SessionConfig,
    /// KV key for the persisted pool state
    pub persist_state_key: String,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            session_config: SessionConfig::default(),
            persist_state_key: SESSION_POOL_STATE_KEY.to_string(),
        }
    }
}

/// Errors from pool operations
#[derive(Debug, thiserror::Error)]
pub enum SessionPoolError {
    /// The pool is at capacity and every session is still usable
    #[error("Session pool is full ({0} usable sessions)")]
    Full(usize),

    /// The persistence layer failed
    #[error("Session pool persistence failed: {0}")]
    Storage(String),
}

/// Persisted pool snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPoolState {
    pub usable_sessions_count: usize,
    pub retired_sessions_count: usize,
    pub sessions: Vec<SessionState>,
}

/// Bounded, randomly rotated session population
pub struct SessionPool {
    config: SessionPoolConfig,
    factory: SessionFactory,
    sessions: Mutex<Vec<Session>>,
    store: Option<Arc<dyn KeyValueStore>>,
    discarded_tx: broadcast::Sender<String>,
    persist_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Create a pool with the default factory
    #[must_use]
    pub fn new(config: SessionPoolConfig) -> Self {
        let (discarded_tx, _) = broadcast::channel(64);
        Self {
            config,
            factory: Arc::new(|config: &SessionConfig| Session::new(config)),
            sessions: Mutex::new(Vec::new()),
            store: None,
            discarded_tx,
            persist_listener: Mutex::new(None),
        }
    }

    /// Replace the session factory
    #[must_use]
    pub fn with_factory(mut self, factory: SessionFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Persist pool state into `store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Restore persisted sessions and attach to the event bus
    ///
    /// Only sessions that are still usable after rehydration survive the
    /// restore. When a bus is given, the pool persists on every
    /// `PersistState` tick until [`SessionPool::teardown`].
    pub async fn initialize(
        self: &Arc<Self>,
        bus: Option<&Arc<EventBus>>,
    ) -> Result<(), SessionPoolError> {
        if let Some(store) = &self.store {
            let state: Option<SessionPoolState> =
                crate::storage::get_json(store.as_ref(), &self.config.persist_state_key)
                    .await
                    .map_err(|e| SessionPoolError::Storage(e.to_string()))?;
            if let Some(state) = state {
                let mut restored = 0usize;
                let mut sessions = self.sessions.lock();
                for session_state in state.sessions {
                    let session =
                        Session::from_state(session_state, &self.config.session_config);
                    if session.is_usable() {
                        sessions.push(session);
                        restored += 1;
                    }
                }
                info!("Session pool restored {restored} usable sessions");
            }
        }

        if let Some(bus) = bus {
            let mut receiver = bus.subscribe();
            let pool = Arc::clone(self);
            let listener = tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(SchedulerEvent::PersistState { is_migrating, .. }) => {
                            if let Err(e) = pool.persist_state().await {
                                warn!(
                                    "Session pool persistence failed (migrating: {is_migrating}): {e}"
                                );
                            }
                        }
                        Ok(SchedulerEvent::Shutdown { .. }) | Err(broadcast::error::RecvError::Closed) => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("Session pool persist listener lagged by {missed} events");
                        }
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

    /// Acquire a usable session
    ///
    /// Below capacity a fresh session is created. At capacity one is
    /// picked uniformly at random; an unusable pick triggers a sweep of
    /// all unusable sessions followed by a fresh creation.
    pub fn get_session(&self) -> Session {
        let mut sessions = self.sessions.lock();

        if sessions.len() < self.config.max_pool_size {
            let session = (self.factory)(&self.config.session_config);
            sessions.push(session.clone());
            return session;
        }

        let pick = rand::rng().random_range(0..sessions.len());
        if sessions[pick].is_usable() {
            return sessions[pick].clone();
        }

        // One sweep removes everything unusable, then we start fresh.
        let before = sessions.len();
        let discarded: Vec<String> = sessions
            .iter()
            .filter(|s| !s.is_usable())
            .map(|s| s.id().to_string())
            .collect();
        sessions.retain(Session::is_usable);
        debug!(
            "Session pool evicted {} unusable sessions",
            before - sessions.len()
        );
        drop(sessions);
        for id in discarded {
            let _ = self.discarded_tx.send(id);
        }

        let session = (self.factory)(&self.config.session_config);
        self.sessions.lock().push(session.clone());
        session
    }

    /// The session with `id`, iff it is still usable
    #[must_use]
    pub fn get_session_by_id(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .find(|s| s.id() == id)
            .filter(|s| s.is_usable())
            .cloned()
    }

    /// Register an externally created session
    ///
    /// At capacity, unusable sessions are evicted first; if the pool is
    /// still full the session is rejected.
    pub fn add_session(&self, session: Session) -> Result<(), SessionPoolError> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.config.max_pool_size {
            sessions.retain(Session::is_usable);
        }
        if sessions.len() >= self.config.max_pool_size {
            return Err(SessionPoolError::Full(sessions.len()));
        }
        sessions.push(session);
        Ok(())
    }

    /// Hard-retire a session and notify listeners
    pub fn retire_session(&self, session: &Session) {
        session.retire();
        let _ = self.discarded_tx.send(session.id().to_string());
    }

    /// Notify listeners that a session retired itself
    ///
    /// Used after [`Session::retire_on_blocked_status_codes`] returns
    /// true, so owning browsers can be torn down.
    pub fn emit_discarded(&self, session_id: &str) {
        let _ = self.discarded_tx.send(session_id.to_string());
    }

    /// Listen for discarded-session ids
    #[must_use]
    pub fn subscribe_discarded(&self) -> broadcast::Receiver<String> {
        self.discarded_tx.subscribe()
    }

    /// Total sessions currently in the pool
    #[must_use]
    pub fn size(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Sessions currently usable
    #[must_use]
    pub fn usable_sessions_count(&self) -> usize {
        self.sessions.lock().iter().filter(|s| s.is_usable()).count()
    }

    /// Sessions currently unusable (expired, overused or blocked)
    #[must_use]
    pub fn retired_sessions_count(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|s| !s.is_usable())
            .count()
    }

    /// Snapshot of the pool, as it would be persisted
    #[must_use]
    pub fn get_state(&self) -> SessionPoolState {
        let sessions = self.sessions.lock();
        let usable = sessions.iter().filter(|s| s.is_usable()).count();
        SessionPoolState {
            usable_sessions_count: usable,
            retired_sessions_count: sessions.len() - usable,
            sessions: sessions.iter().map(Session::state).collect(),
        }
    }

    /// Write the current snapshot to the KV store
    pub async fn persist_state(&self) -> Result<(), SessionPoolError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let state = self.get_state();
        crate::storage::set_json(store.as_ref(), &self.config.persist_state_key, &state)
            .await
            .map_err(|e| SessionPoolError::Storage(e.to_string()))
    }

    /// Detach from the bus and write one final snapshot
    pub async fn teardown(&self) {
        if let Some(listener) = self.persist_listener.lock().take() {
            listener.abort();
        }
        if let Err(e) = self.persist_state().await {
            warn!("Final session pool persistence failed: {e}");
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        if let Some(listener) = self.persist_listener.lock().take() {
            listener.abort();
        }
    }
}
