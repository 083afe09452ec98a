//! Single client-identity session

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Tuning knobs for a single session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime before the session expires
    pub max_age_secs: u64,
    /// Usage cap; the session is unusable once reached
    pub max_usage_count: u64,
    /// Error score at which the session counts as blocked
    pub max_error_score: f64,
    /// Score subtracted on every successful use
    pub error_score_decrement: f64,
    /// HTTP statuses that retire the session outright
    pub blocked_status_codes: Vec<u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 3000,
            max_usage_count: 50,
            max_error_score: 3.0,
            error_score_decrement: 0.5,
            blocked_status_codes: vec![401, 403, 429],
        }
    }
}

/// Serializable session snapshot, also the persisted wire form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: u64,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub max_usage_count: u64,
    #[serde(default)]
    pub user_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
struct SessionInner {
    usage_count: u64,
    error_score: f64,
    user_data: serde_json::Map<String, serde_json::Value>,
}

/// A reusable client identity with health state
///
/// Cloning shares the same underlying session; usage counters and the
/// score are mutated through short internal locks.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    max_error_score: f64,
    error_score_decrement: f64,
    max_usage_count: u64,
    blocked_status_codes: Arc<Vec<u16>>,
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    /// Create a fresh session from config
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4().simple()),
            created_at,
            expires_at: created_at + ChronoDuration::seconds(config.max_age_secs as i64),
            max_error_score: config.max_error_score,
            error_score_decrement: config.error_score_decrement,
            max_usage_count: config.max_usage_count,
            blocked_status_codes: Arc::new(config.blocked_status_codes.clone()),
            inner: Arc::new(Mutex::new(SessionInner {
                usage_count: 0,
                error_score: 0.0,
                user_data: serde_json::Map::new(),
            })),
        }
    }

    /// Rehydrate a session from its persisted state
    #[must_use]
    pub fn from_state(state: SessionState, config: &SessionConfig) -> Self {
        Self {
            id: state.id,
            created_at: state.created_at,
            expires_at: state.expires_at,
            max_error_score: state.max_error_score,
            error_score_decrement: state.error_score_decrement,
            max_usage_count: state.max_usage_count,
            blocked_status_codes: Arc::new(config.blocked_status_codes.clone()),
            inner: Arc::new(Mutex::new(SessionInner {
                usage_count: state.usage_count,
                error_score: state.error_score,
                user_data: state.user_data,
            })),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn usage_count(&self) -> u64 {
        self.inner.lock().usage_count
    }

    #[must_use]
    pub fn error_score(&self) -> f64 {
        self.inner.lock().error_score
    }

    /// `now >= expires_at`
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// `usage_count >= max_usage_count`
    #[must_use]
    pub fn is_overused(&self) -> bool {
        self.inner.lock().usage_count >= self.max_usage_count
    }

    /// `error_score >= max_error_score`
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.inner.lock().error_score >= self.max_error_score
    }

    /// Not expired, not overused, not blocked
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_expired() && !self.is_overused() && !self.is_blocked()
    }

    /// Record a successful use
    pub fn mark_good(&self) {
        let mut inner = self.inner.lock();
        inner.usage_count += 1;
        if inner.error_score > 0.0 {
            inner.error_score = (inner.error_score - self.error_score_decrement).max(0.0);
        }
    }

    /// Record a soft failure
    pub fn mark_bad(&self) {
        let mut inner = self.inner.lock();
        inner.usage_count += 1;
        inner.error_score += 1.0;
    }

    /// Hard-retire the session; it is unusable from now on
    pub fn retire(&self) {
        let mut inner = self.inner.lock();
        inner.error_score += self.max_error_score;
        debug!("Session {} retired", self.id);
    }

    /// Retire if `status` is in the configured blocked set
    ///
    /// Returns whether the session opted to retire.
    #[must_use]
    pub fn retire_on_blocked_status_codes(&self, status: u16) -> bool {
        if self.blocked_status_codes.contains(&status) {
            self.retire();
            true
        } else {
            false
        }
    }

    /// Read an opaque user-data entry
    #[must_use]
    pub fn user_data_entry(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().user_data.get(key).cloned()
    }

    /// Write an opaque user-data entry
    pub fn set_user_data_entry(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().user_data.insert(key.into(), value);
    }

    /// Merge cookies into the session's jar
    ///
    /// Cookie names match ASCII case-insensitively; the casing of the
    /// first-seen name is preserved. Non-ASCII names are compared
    /// byte-for-byte.
    pub fn merge_cookies<'a>(&self, cookies: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut inner = self.inner.lock();
        let jar = inner
            .user_data
            .entry("cookies".to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        let Some(jar) = jar.as_object_mut() else {
            return;
        };
        for (name, value) in cookies {
            let existing_key = jar
                .keys()
                .find(|k| k.eq_ignore_ascii_case(name))
                .cloned();
            let key = existing_key.unwrap_or_else(|| name.to_string());
            jar.insert(key, serde_json::Value::String(value.to_string()));
        }
    }

    /// The session's cookie jar as name/value pairs
    #[must_use]
    pub fn cookies(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        inner
            .user_data
            .get("cookies")
            .and_then(|v| v.as_object())
            .map(|jar| {
                jar.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot for persistence
    #[must_use]
    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock();
        SessionState {
            id: self.id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            usage_count: inner.usage_count,
            error_score: inner.error_score,
            max_error_score: self.max_error_score,
            error_score_decrement: self.error_score_decrement,
            max_usage_count: self.max_usage_count,
            user_data: inner.user_data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> SessionConfig {
        SessionConfig {
            max_usage_count: 3,
            max_error_score: 2.0,
            error_score_decrement: 0.5,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_fresh_session_is_usable() {
        let session = Session::new(&quick_config());
        assert!(session.is_usable());
        assert!(!session.is_expired());
        assert!(!session.is_overused());
        assert!(!session.is_blocked());
    }

    #[test]
    fn test_usage_cap_makes_session_unusable() {
        let session = Session::new(&quick_config());
        session.mark_good();
        session.mark_good();
        assert!(session.is_usable());
        session.mark_good();
        assert!(session.is_overused());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_mark_bad_accumulates_and_good_decays() {
        let session = Session::new(&SessionConfig {
            max_usage_count: 100,
            ..quick_config()
        });
        session.mark_bad();
        session.mark_bad();
        assert!(session.is_blocked());
        // Score decays on success but never below zero.
        session.mark_good();
        assert!((session.error_score() - 1.5).abs() < f64::EPSILON);
        session.mark_good();
        session.mark_good();
        session.mark_good();
        assert!(session.error_score() >= 0.0);
    }

    #[test]
    fn test_retire_blocks_immediately() {
        let session = Session::new(&quick_config());
        session.retire();
        assert!(session.is_blocked());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_blocked_status_codes() {
        let session = Session::new(&quick_config());
        assert!(!session.retire_on_blocked_status_codes(200));
        assert!(session.is_usable());
        assert!(session.retire_on_blocked_status_codes(403));
        assert!(!session.is_usable());
    }

    #[test]
    fn test_expired_session_from_state() {
        let config = quick_config();
        let mut state = Session::new(&config).state();
        state.expires_at = Utc::now() - ChronoDuration::seconds(1);
        let session = Session::from_state(state, &config);
        assert!(session.is_expired());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_cookie_merge_preserves_first_casing() {
        let session = Session::new(&quick_config());
        session.merge_cookies([("SessionId", "abc")]);
        session.merge_cookies([("sessionid", "def"), ("other", "1")]);
        let mut cookies = session.cookies();
        cookies.sort();
        assert_eq!(
            cookies,
            vec![
                ("SessionId".to_string(), "def".to_string()),
                ("other".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_state_round_trip() {
        let config = quick_config();
        let session = Session::new(&config);
        session.mark_bad();
        session.merge_cookies([("a", "1")]);
        let restored = Session::from_state(session.state(), &config);
        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.usage_count(), 1);
        assert_eq!(restored.cookies(), session.cookies());
    }
}
