//! Session store backed by an external cache service
//!
//! A session is one hash under `{prefix}{id}`: `createdAt` and
//! `lastAccessedAt` in epoch milliseconds, plus one `attr:{name}` field per
//! attribute holding its JSON value. Touches and attribute writes change only
//! their own field, so concurrent requests on a session never overwrite each
//! other's attributes. The key's expiry is renewed on every touch.
//!
//! Ids are checked against the allow-list pattern before they are
//! interpolated into any key, so a malformed id never reaches the network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error};

use super::{
    cache::{CacheBackend, CacheError},
    new_session_id, now_millis, validate_session_id, Session, SessionStore, SessionStoreError,
};
use crate::resilience::{Resilience, ResilienceError};

const CREATE_ATTEMPTS: usize = 3;

const CREATED_AT: &str = "createdAt";
const LAST_ACCESSED_AT: &str = "lastAccessedAt";
const ATTRIBUTE_PREFIX: &str = "attr:";

pub struct DistributedSessionStore<B> {
    backend: B,
    resilience: Resilience,
    key_prefix: String,
    ttl: Duration,
}

impl<B: CacheBackend> DistributedSessionStore<B> {
    pub fn new(backend: B, key_prefix: impl Into<String>, ttl: Duration, resilience: Resilience) -> Self {
        Self {
            backend,
            resilience,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    fn key(&self, id: &str) -> Result<String, SessionStoreError> {
        validate_session_id(id)?;
        Ok(format!("{}{}", self.key_prefix, id))
    }

    async fn load(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        let key = self.key(id)?;
        let fields = self
            .resilience
            .call("session.get", || self.backend.hash_get_all(&key))
            .await
            .map_err(store_error)?;

        if fields.is_empty() {
            return Ok(None);
        }
        let session = decode(id, &fields)?;
        if session.is_expired(self.ttl) {
            return Ok(None);
        }
        Ok(Some(session))
    }
}

fn attribute_field(name: &str) -> String {
    format!("{ATTRIBUTE_PREFIX}{name}")
}

fn timestamp(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>, SessionStoreError> {
    fields
        .get(name)
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| SessionStoreError::Backend(format!("session record has no valid {name}")))
}

fn decode(id: &str, fields: &HashMap<String, String>) -> Result<Session, SessionStoreError> {
    let mut attributes = HashMap::new();
    for (field, raw) in fields {
        if let Some(name) = field.strip_prefix(ATTRIBUTE_PREFIX) {
            attributes.insert(name.to_string(), serde_json::from_str(raw)?);
        }
    }

    Ok(Session {
        id: id.to_string(),
        created_at: timestamp(fields, CREATED_AT)?,
        last_accessed_at: timestamp(fields, LAST_ACCESSED_AT)?,
        attributes,
    })
}

fn store_error(err: ResilienceError<CacheError>) -> SessionStoreError {
    match err {
        ResilienceError::CircuitOpen(_) => SessionStoreError::Unavailable,
        ResilienceError::Failed { source, .. } => {
            error!(error = %source, "session backend call failed");
            SessionStoreError::Backend(source.to_string())
        }
    }
}

#[async_trait]
impl<B: CacheBackend> SessionStore for DistributedSessionStore<B> {
    async fn create_session(&self) -> Result<Session, SessionStoreError> {
        for _ in 0..CREATE_ATTEMPTS {
            let session = Session::new(new_session_id());
            let key = self.key(&session.id)?;
            let fields = [
                (CREATED_AT.to_string(), session.created_at.timestamp_millis().to_string()),
                (
                    LAST_ACCESSED_AT.to_string(),
                    session.last_accessed_at.timestamp_millis().to_string(),
                ),
            ];

            let inserted = self
                .resilience
                .call("session.create", || {
                    self.backend.hash_create(&key, &fields, self.ttl)
                })
                .await
                .map_err(store_error)?;
            if inserted {
                debug!(session_id = %session.id, "session created");
                return Ok(session);
            }
        }

        Err(SessionStoreError::Backend(
            "could not allocate a unique session id".to_string(),
        ))
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        self.load(id).await
    }

    async fn touch_session(&self, id: &str) -> Result<(), SessionStoreError> {
        let key = self.key(id)?;
        let now = now_millis();
        self.resilience
            .call("session.touch", || {
                self.backend.hash_raise(&key, LAST_ACCESSED_AT, now, self.ttl)
            })
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), SessionStoreError> {
        let key = self.key(id)?;
        self.resilience
            .call("session.delete", || self.backend.delete(&key))
            .await
            .map_err(store_error)
    }

    async fn active_session_count(&self) -> Result<usize, SessionStoreError> {
        self.resilience
            .call("session.count", || self.backend.count_prefix(&self.key_prefix))
            .await
            .map_err(store_error)
    }

    async fn set_attribute(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, SessionStoreError> {
        let session_key = self.key(id)?;
        let field = attribute_field(key);
        let payload = serde_json::to_string(&value)?;

        self.resilience
            .call("session.set_attribute", || {
                self.backend.hash_set_existing(&session_key, &field, &payload)
            })
            .await
            .map_err(store_error)
    }

    async fn remove_attribute(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<Value>, SessionStoreError> {
        let session_key = self.key(id)?;
        let field = attribute_field(key);

        let previous = self
            .resilience
            .call("session.remove_attribute", || {
                self.backend.hash_take(&session_key, &field)
            })
            .await
            .map_err(store_error)?;
        previous
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(SessionStoreError::from)
    }
}
