//! Client-identity sessions and the rotating session pool
//!
//! A session is a reusable client identity: cookies, fingerprint seed and
//! a health score. The pool keeps a bounded, randomly rotated population
//! of them, evicting unusable sessions and persisting the survivors so a
//! migrated process resumes with warm identities.

pub mod pool;
#[allow(clippy::module_inception)]
pub mod session;

pub use pool::{SessionPool, SessionPoolConfig, SessionPoolError, SessionPoolState};
pub use session::{Session, SessionConfig, SessionState};
