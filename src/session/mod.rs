//! Session lifecycle
//!
//! A session is created at `initialize` (or on demand by a handler), touched on
//! every access to extend its time-to-live, and removed explicitly or by an
//! expiry sweep. Expired sessions are indistinguishable from absent ones on
//! every read path.
//!
//! Two stores share the [`SessionStore`] contract:
//! - [`local::LocalSessionStore`], an in-process concurrent map
//! - [`distributed::DistributedSessionStore`], backed by an external cache
//!   service through a circuit breaker and retry policy

pub mod cache;
pub mod distributed;
pub mod local;

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use cache::{CacheBackend, CacheError, RedisCache};
pub use distributed::DistributedSessionStore;
pub use local::LocalSessionStore;

/// Lowercase hyphenated UUID, exactly 36 characters.
static SESSION_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("session id pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Session {
    pub fn new(id: String) -> Self {
        let now = now_millis_precision();
        Self {
            id,
            created_at: now,
            last_accessed_at: now,
            attributes: HashMap::new(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        is_expired_at(self.last_accessed_at.timestamp_millis(), ttl)
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("session store unavailable")]
    Unavailable,
    #[error("session store backend failure: {0}")]
    Backend(String),
    #[error("session serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self) -> Result<Session, SessionStoreError>;

    /// `None` when the session is absent or expired.
    async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionStoreError>;

    /// Extends the session's lifetime. Absent sessions are ignored.
    async fn touch_session(&self, id: &str) -> Result<(), SessionStoreError>;

    async fn delete_session(&self, id: &str) -> Result<(), SessionStoreError>;

    async fn is_valid_session(&self, id: &str) -> Result<bool, SessionStoreError> {
        Ok(self.get_session(id).await?.is_some())
    }

    async fn active_session_count(&self) -> Result<usize, SessionStoreError>;

    /// Returns `false` when the session is absent.
    async fn set_attribute(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, SessionStoreError>;

    async fn remove_attribute(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<Value>, SessionStoreError>;
}

pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_PATTERN.is_match(id)
}

pub fn validate_session_id(id: &str) -> Result<(), SessionStoreError> {
    if is_valid_session_id(id) {
        Ok(())
    } else {
        Err(SessionStoreError::InvalidSessionId)
    }
}

pub(crate) fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn now_millis_precision() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(now_millis()).unwrap_or_else(Utc::now)
}

pub(crate) fn is_expired_at(last_accessed_ms: i64, ttl: Duration) -> bool {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_sub(last_accessed_ms) > ttl_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_pass_validation() {
        for _ in 0..32 {
            assert!(is_valid_session_id(&new_session_id()));
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        let valid = "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b";
        assert!(is_valid_session_id(valid));

        for bad in [
            "3F2B8C1E-9A4D-4E6F-8B7A-1C2D3E4F5A6B",
            "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6",
            "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b0",
            "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6\n",
            "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a\r\nb",
            "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b\nDEL x",
            "*",
            "",
        ] {
            assert!(!is_valid_session_id(bad), "accepted {bad:?}");
        }
    }

    #[test]
    fn expiry_measures_from_last_access() {
        let mut session = Session::new(new_session_id());
        assert!(!session.is_expired(Duration::from_secs(60)));

        session.last_accessed_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(session.is_expired(Duration::from_secs(60)));
        assert!(!session.is_expired(Duration::from_secs(600)));
    }
}
