//! Hash-oriented cache service used by the distributed session store
//!
//! Each session is one hash, and every mutation touches only the fields it
//! changes. Conditional writes run as server-side scripts so the existence
//! check and the write happen in one step.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, RedisError, Script};
use thiserror::Error;
use tracing::debug;

use crate::resilience::Transient;

const SCAN_BATCH: usize = 200;

/// KEYS[1] hash; ARGV[1] ttl ms; ARGV[2..] field/value pairs.
static CREATE_HASH: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
        redis.call('HSET', KEYS[1], unpack(ARGV, 2))
        redis.call('PEXPIRE', KEYS[1], ARGV[1])
        return 1
        ",
    )
});

/// KEYS[1] hash; ARGV[1] field; ARGV[2] value.
static SET_EXISTING_FIELD: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        return 1
        ",
    )
});

/// KEYS[1] hash; ARGV[1] ttl ms; ARGV[2] field; ARGV[3] integer value.
static RAISE_FIELD: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('HGET', KEYS[1], ARGV[2])
        if not current then return 0 end
        if tonumber(ARGV[3]) > tonumber(current) then
            redis.call('HSET', KEYS[1], ARGV[2], ARGV[3])
        end
        redis.call('PEXPIRE', KEYS[1], ARGV[1])
        return 1
        ",
    )
});

/// KEYS[1] hash; ARGV[1] field.
static TAKE_FIELD: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local value = redis.call('HGET', KEYS[1], ARGV[1])
        if value then redis.call('HDEL', KEYS[1], ARGV[1]) end
        return value
        ",
    )
});

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection failure: {0}")]
    Connection(String),
    #[error("cache command failed: {0}")]
    Command(String),
}

impl Transient for CacheError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Hash store with per-key expiry.
///
/// A missing key reads as an empty hash, never an error.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    /// Creates the hash only if the key does not exist; `false` when it already did.
    async fn hash_create(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Writes one field of an existing hash; `false` when the key is absent.
    async fn hash_set_existing(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, CacheError>;

    /// Raises an integer field to `value` if larger and renews the key's expiry.
    /// `false` when the field is absent.
    async fn hash_raise(
        &self,
        key: &str,
        field: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Removes one field, returning its previous value.
    async fn hash_take(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        debug!("redis connection established");

        Ok(Self { connection })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(fields)
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut connection = self.connection.clone();
        let mut invocation = CREATE_HASH.key(key);
        invocation.arg(ttl_millis(ttl));
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let created: i64 = invocation.invoke_async(&mut connection).await?;
        Ok(created == 1)
    }

    async fn hash_set_existing(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, CacheError> {
        let mut connection = self.connection.clone();
        let mut invocation = SET_EXISTING_FIELD.key(key);
        invocation.arg(field).arg(value);
        let written: i64 = invocation.invoke_async(&mut connection).await?;
        Ok(written == 1)
    }

    async fn hash_raise(
        &self,
        key: &str,
        field: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut connection = self.connection.clone();
        let mut invocation = RAISE_FIELD.key(key);
        invocation.arg(ttl_millis(ttl)).arg(field).arg(value);
        let present: i64 = invocation.invoke_async(&mut connection).await?;
        Ok(present == 1)
    }

    async fn hash_take(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection.clone();
        let mut invocation = TAKE_FIELD.key(key);
        invocation.arg(field);
        let previous: Option<String> = invocation.invoke_async(&mut connection).await?;
        Ok(previous)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut connection = self.connection.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut total = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await?;
            total += keys.len();
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_transient() {
        assert!(CacheError::Connection("reset".to_string()).is_transient());
        assert!(!CacheError::Command("WRONGTYPE".to_string()).is_transient());
    }

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }
}
