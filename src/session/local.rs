//! In-process session store
//!
//! Entries live in a sharded concurrent map; the last-accessed timestamp is an
//! atomic so touches never take a write lock on the entry.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use super::{is_expired_at, new_session_id, now_millis, Session, SessionStore, SessionStoreError};

#[derive(Debug)]
struct SessionEntry {
    id: String,
    created_at: DateTime<Utc>,
    last_accessed_ms: AtomicI64,
    attributes: DashMap<String, Value>,
}

impl SessionEntry {
    fn new(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            created_at: session.created_at,
            last_accessed_ms: AtomicI64::new(session.last_accessed_at.timestamp_millis()),
            attributes: DashMap::new(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        is_expired_at(self.last_accessed_ms.load(Ordering::Acquire), ttl)
    }

    fn snapshot(&self) -> Session {
        let last_accessed_ms = self.last_accessed_ms.load(Ordering::Acquire);
        Session {
            id: self.id.clone(),
            created_at: self.created_at,
            last_accessed_at: DateTime::from_timestamp_millis(last_accessed_ms)
                .unwrap_or(self.created_at),
            attributes: self
                .attributes
                .iter()
                .map(|attribute| (attribute.key().clone(), attribute.value().clone()))
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct LocalSessionStore {
    sessions: DashMap<String, Arc<SessionEntry>>,
    ttl: Duration,
}

impl LocalSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Starts the periodic expiry sweep.
    ///
    /// The task holds only a weak reference and ends once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("session store dropped, stopping sweeper");
                    break;
                };

                let removed = store.sweep_expired();
                if removed > 0 {
                    info!(removed, remaining = store.sessions.len(), "expired sessions swept");
                }
            }
        })
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, entry| {
            let keep = !entry.is_expired(self.ttl);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn live_entry(&self, id: &str) -> Option<Arc<SessionEntry>> {
        let entry = self.sessions.get(id).map(|entry| Arc::clone(entry.value()))?;
        if entry.is_expired(self.ttl) {
            self.sessions
                .remove_if(id, |_, stored| stored.is_expired(self.ttl));
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn create_session(&self) -> Result<Session, SessionStoreError> {
        loop {
            let session = Session::new(new_session_id());
            match self.sessions.entry(session.id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(SessionEntry::new(&session)));
                    debug!(session_id = %session.id, "session created");
                    return Ok(session);
                }
            }
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        Ok(self.live_entry(id).map(|entry| entry.snapshot()))
    }

    async fn touch_session(&self, id: &str) -> Result<(), SessionStoreError> {
        if let Some(entry) = self.live_entry(id) {
            entry.last_accessed_ms.fetch_max(now_millis(), Ordering::AcqRel);
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), SessionStoreError> {
        if self.sessions.remove(id).is_some() {
            debug!(session_id = %id, "session deleted");
        }
        Ok(())
    }

    async fn is_valid_session(&self, id: &str) -> Result<bool, SessionStoreError> {
        Ok(self.live_entry(id).is_some())
    }

    async fn active_session_count(&self) -> Result<usize, SessionStoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_expired(self.ttl))
            .count())
    }

    async fn set_attribute(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, SessionStoreError> {
        let Some(entry) = self.live_entry(id) else {
            return Ok(false);
        };
        entry.attributes.insert(key.to_string(), value);
        Ok(true)
    }

    async fn remove_attribute(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<Value>, SessionStoreError> {
        Ok(self
            .live_entry(id)
            .and_then(|entry| entry.attributes.remove(key).map(|(_, value)| value)))
    }
}
