//! Cache Tables component (spec §2 item 9, §6.1 "Secondary caches"): a
//! Redis-backed TTL cache for price/balance/discovery lookups that sit in
//! front of the persistent store. Secondary caches are allowed to be
//! in-memory only, but a Redis-backed layer is kept here matching the
//! teacher's async `redis` idiom (`aio` + `tokio-comp`), generalized from a
//! single-purpose token cache to a generic TTL key/value store keyed by
//! caller-chosen namespaces.

use anyhow::Result;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Thin async wrapper around a Redis connection manager, storing
/// JSON-serialized values under caller-supplied keys with a TTL.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
    default_ttl: Duration,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, default_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_tokio_connection_manager().await?;
        Ok(Self { manager, default_ttl })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.manager.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "redis cache read failed");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(value)?;
        let _: () = conn.set_ex(key, raw, ttl.as_secs().max(1) as usize).await?;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Invalidates every key under a namespace prefix (spec §4.6 "manual
    /// token addition invalidates cached discovery results sharing the same
    /// address prefix").
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = conn.keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(());
        }
        debug!(prefix, count = keys.len(), "invalidating cache keys by prefix");
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ttl_is_positive() {
        assert!(Duration::from_secs(300).as_secs() > 0);
    }
}
