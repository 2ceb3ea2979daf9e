//! Redis-backed state store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{StoreError, StoreResult};
use crate::store::StateStore;

/// Redis state store shared by every service instance.
///
/// - Async operations over a pooled [`ConnectionManager`] with automatic reconnection
/// - Key prefixing for namespace isolation
/// - `INCR` + `EXPIRE` issued as one `MULTI/EXEC` pipeline
/// - Every command bounded by an operation timeout
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
}

impl RedisStateStore {
    /// Connects to Redis.
    ///
    /// `connect_timeout` bounds the initial handshake; `op_timeout` bounds every
    /// subsequent command.
    pub async fn connect(
        url: &str,
        prefix: &str,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis URL {url}: {e}")))?;

        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let store = Self {
            conn,
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}:")
            },
            op_timeout,
        };

        store.ping().await?;
        Ok(store)
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn bounded<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

impl std::fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("prefix", &self.prefix)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

/// Redis rejects zero-second expiries.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(skip(self), fields(store_key = %key))]
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl) as i64;

        let (value,): (i64,) = self
            .bounded(async move {
                redis::pipe()
                    .atomic()
                    .incr(&full_key, 1)
                    .expire(&full_key, secs)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(value)
    }

    #[tracing::instrument(skip(self), fields(store_key = %key))]
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();

        self.bounded(async move { conn.get::<_, Option<String>>(&full_key).await })
            .await
    }

    #[tracing::instrument(skip(self, value), fields(store_key = %key))]
    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();

        self.bounded(async move { conn.set::<_, _, ()>(&full_key, value).await })
            .await
    }

    #[tracing::instrument(skip(self, value), fields(store_key = %key, ttl_secs = ttl.as_secs()))]
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl);

        self.bounded(async move { conn.set_ex::<_, _, ()>(&full_key, value, secs).await })
            .await
    }

    #[tracing::instrument(skip(self), fields(store_key = %key))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();

        self.bounded(async move { conn.del::<_, ()>(&full_key).await })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();

        let pong: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("unexpected PING reply: {pong}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(120)), 120);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_redis_fails() {
        let result = RedisStateStore::connect(
            "redis://127.0.0.1:1",
            "tripwire",
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStateStore::connect(
            "not-a-url",
            "tripwire",
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
