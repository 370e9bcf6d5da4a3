//! Counter store: the single place where cross-cutting mutable admission
//! state lives.
//!
//! [`CounterStore`] is a tagged choice between two backends with identical
//! semantics, selected at startup:
//!
//! - [`LocalStore`] keeps counters and TTL-bearing values in a process-local
//!   [`DashMap`]. Expired entries are treated as absent on read, and a
//!   periodic sweep (spawned by the server) evicts them. Increment and
//!   eviction on one key are serialized through the map's shard locks.
//! - [`SharedStore`] talks to redis, whose per-key TTL does the aging. The
//!   TTL is applied only by the increment that creates a key, so later hits
//!   never stretch the window. Every operation is bounded by a timeout so a
//!   slow backend can never stall an admission decision.
//!
//! Both backends guarantee that concurrent increments on the same key are
//! serialized: the post-increment value each caller observes is unique.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use crate::{GatewayError, Result};

/// Current wall-clock time as whole seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A named-counter store with per-key expiry, backed either by a local
/// in-process map or by a shared redis instance.
#[derive(Debug, Clone)]
pub enum CounterStore {
    /// Process-local backend.
    Local(LocalStore),
    /// Shared redis backend.
    Shared(SharedStore),
}

impl CounterStore {
    /// Atomically increments `key`, creating it at zero first if absent,
    /// and returns the post-increment value.
    ///
    /// `ttl` is applied only when this increment creates the key; an
    /// existing key keeps its original expiry.
    pub async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        match self {
            Self::Local(store) => Ok(store.increment(key, ttl)),
            Self::Shared(store) => store.increment(key, ttl).await,
        }
    }

    /// Stores `value` under `key`, overwriting any existing entry and
    /// resetting its expiry to `ttl` from now.
    pub async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        match self {
            Self::Local(store) => {
                store.set_with_expiry(key, value, ttl);
                Ok(())
            }
            Self::Shared(store) => store.set_with_expiry(key, value, ttl).await,
        }
    }

    /// Returns the live value under `key`, if any. Expired entries read as
    /// absent regardless of whether the backend has evicted them yet.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Local(store) => Ok(store.get(key)),
            Self::Shared(store) => store.get(key).await,
        }
    }

    /// Returns `true` if a live value exists under `key`.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Local(store) => Ok(store.get(key).is_some()),
            Self::Shared(store) => store.exists(key).await,
        }
    }

    /// Removes the given keys. Missing keys are not an error.
    pub async fn delete(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        match self {
            Self::Local(store) => {
                store.delete(keys);
                Ok(())
            }
            Self::Shared(store) => store.delete(keys).await,
        }
    }
}

#[derive(Debug)]
enum Value {
    Count(u64),
    Text(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Process-local counter store.
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl LocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `key` and returns the post-increment count.
    ///
    /// The entry API holds the key's shard lock for the whole
    /// read-modify-write, so concurrent increments and sweep-time evictions
    /// on the same key are linearized.
    pub fn increment(&self, key: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| Entry {
            value: Value::Count(0),
            expires_at: now + ttl,
        });

        // A dead entry the sweep has not reached yet, or a non-counter
        // value under the same key, starts a fresh window.
        if entry.expires_at <= now || !matches!(entry.value, Value::Count(_)) {
            *entry = Entry {
                value: Value::Count(0),
                expires_at: now + ttl,
            };
        }

        if let Value::Count(n) = &mut entry.value {
            *n += 1;
            *n
        } else {
            1
        }
    }

    /// Stores `value`, overwriting any existing entry and its expiry.
    pub fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Text(value.to_owned()),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Returns the live value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(match &entry.value {
            Value::Count(n) => n.to_string(),
            Value::Text(s) => s.clone(),
        })
    }

    /// Removes the given keys.
    pub fn delete(&self, keys: &[&str]) {
        for key in keys {
            self.entries.remove(*key);
        }
    }

    /// Evicts every expired entry, returning how many were removed.
    ///
    /// Reads already treat expired entries as absent; the sweep only bounds
    /// memory growth.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Number of entries currently held, including not-yet-swept dead ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared counter store backed by redis.
///
/// Uses a [`ConnectionManager`], which multiplexes and reconnects
/// transparently; clones share the same underlying connection.
#[derive(Clone)]
pub struct SharedStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl SharedStore {
    /// Connects to redis at `url`. Every subsequent operation is bounded by
    /// `op_timeout`.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Store(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Store(format!("failed to connect to redis: {e}")))?;

        Ok(Self { conn, op_timeout })
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GatewayError::Store(format!("{op} failed: {e}"))),
            Err(_) => Err(GatewayError::Store(format!(
                "{op} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    /// `INCR`, then `EXPIRE` only when the increment created the key, so a
    /// busy window keeps its original expiry.
    pub async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .bounded("INCR", redis::cmd("INCR").arg(key).query_async(&mut conn))
            .await?;

        if count == 1 {
            let _: i64 = self
                .bounded(
                    "EXPIRE",
                    redis::cmd("EXPIRE")
                        .arg(key)
                        .arg(ttl.as_secs().max(1))
                        .query_async(&mut conn),
                )
                .await?;
        }

        Ok(count)
    }

    /// `SET` with expiry; overwrites any existing value and its TTL.
    pub async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded(
            "SETEX",
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
        )
        .await
    }

    /// `GET`. Redis evicts expired keys itself, so a live response is
    /// authoritative.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded("GET", conn.get::<_, Option<String>>(key)).await
    }

    /// `EXISTS`.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.bounded("EXISTS", conn.exists::<_, bool>(key)).await
    }

    /// `DEL` over the given keys.
    pub async fn delete(&self, keys: &[&str]) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("DEL", conn.del::<_, ()>(keys.to_vec())).await
    }
}
