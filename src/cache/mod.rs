//! Typed Redis adapter.
//!
//! Wraps a multiplexed [`ConnectionManager`] with the semantic operations the
//! gateway needs. Backend faults never propagate into callers' hot paths:
//! reads return absent/empty, writes return failure, and every error is
//! logged here.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, FromRedisValue, Pipeline};
use std::collections::HashMap;
use tracing::warn;

/// Minimal string-cache surface the authorization resolver depends on.
/// Split out as a trait so the resolver is testable with in-memory fakes.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get_string(&self, key: &str) -> Option<String>;
    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> bool;
    async fn delete(&self, key: &str) -> bool;
}

#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
    default_ttl_secs: u64,
}

impl CacheClient {
    pub fn new(conn: ConnectionManager, default_ttl_secs: u64) -> CacheClient {
        CacheClient {
            conn,
            default_ttl_secs: default_ttl_secs.max(1),
        }
    }

    /// Non-positive TTLs are replaced by the configured default so no write
    /// can create a permanent key.
    fn effective_ttl(&self, ttl_secs: i64) -> u64 {
        if ttl_secs <= 0 {
            self.default_ttl_secs
        } else {
            ttl_secs as u64
        }
    }

    /// Spread expirations by up to 10% to avoid synchronized stampedes.
    fn jitter(ttl_secs: u64) -> u64 {
        let jitter = rand::thread_rng().gen_range(0..=ttl_secs / 10);
        ttl_secs + jitter
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, "redis GET failed");
                None
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: i64) -> bool {
        let ttl = Self::jitter(self.effective_ttl(ttl_secs));
        let mut conn = self.conn.clone();
        match conn.set_ex::<_, _, ()>(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%key, error = %e, "redis SETEX failed");
                false
            }
        }
    }

    pub async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> bool {
        let mut conn = self.conn.clone();
        match conn.hset_multiple::<_, _, _, ()>(key, fields).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%key, error = %e, "redis HSET failed");
                false
            }
        }
    }

    pub async fn hget_all(&self, key: &str) -> HashMap<String, String> {
        let mut conn = self.conn.clone();
        match conn.hgetall::<_, HashMap<String, String>>(key).await {
            Ok(map) => map,
            Err(e) => {
                warn!(%key, error = %e, "redis HGETALL failed");
                HashMap::new()
            }
        }
    }

    pub async fn hdel(&self, key: &str, field: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.hdel::<_, _, i64>(key, field).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(%key, %field, error = %e, "redis HDEL failed");
                false
            }
        }
    }

    pub async fn hincr(&self, key: &str, field: &str, delta: i64) -> Option<i64> {
        let mut conn = self.conn.clone();
        match conn.hincr::<_, _, _, i64>(key, field, delta).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(%key, %field, error = %e, "redis HINCRBY failed");
                None
            }
        }
    }

    /// Returns the number of members actually added, or `None` on error.
    pub async fn sadd(&self, key: &str, member: &str) -> Option<i64> {
        let mut conn = self.conn.clone();
        match conn.sadd::<_, _, i64>(key, member).await {
            Ok(added) => Some(added),
            Err(e) => {
                warn!(%key, error = %e, "redis SADD failed");
                None
            }
        }
    }

    pub async fn srem(&self, key: &str, member: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.srem::<_, _, i64>(key, member).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(%key, error = %e, "redis SREM failed");
                false
            }
        }
    }

    pub async fn smembers(&self, key: &str) -> Vec<String> {
        let mut conn = self.conn.clone();
        match conn.smembers::<_, Vec<String>>(key).await {
            Ok(members) => members,
            Err(e) => {
                warn!(%key, error = %e, "redis SMEMBERS failed");
                Vec::new()
            }
        }
    }

    pub async fn scard(&self, key: &str) -> usize {
        let mut conn = self.conn.clone();
        match conn.scard::<_, usize>(key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(%key, error = %e, "redis SCARD failed");
                0
            }
        }
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.zadd::<_, _, _, ()>(key, member, score).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%key, error = %e, "redis ZADD failed");
                false
            }
        }
    }

    pub async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        let mut conn = self.conn.clone();
        match conn
            .zrangebyscore::<_, _, _, Vec<String>>(key, min, max)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(%key, error = %e, "redis ZRANGEBYSCORE failed");
                Vec::new()
            }
        }
    }

    /// Returns true only if the member existed and was removed; used as an
    /// ownership claim by concurrent timeout scanners.
    pub async fn zrem(&self, key: &str, member: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.zrem::<_, _, i64>(key, member).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(%key, error = %e, "redis ZREM failed");
                false
            }
        }
    }

    pub async fn del(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.del::<_, i64>(key).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(%key, error = %e, "redis DEL failed");
                false
            }
        }
    }

    /// Returns false both on error and when the key does not exist; callers
    /// that need the distinction should pipeline EXPIRE and inspect the
    /// reply themselves.
    pub async fn expire(&self, key: &str, ttl_secs: i64) -> bool {
        let ttl = self.effective_ttl(ttl_secs) as i64;
        let mut conn = self.conn.clone();
        match conn.expire::<_, i64>(key, ttl).await {
            Ok(applied) => applied > 0,
            Err(e) => {
                warn!(%key, error = %e, "redis EXPIRE failed");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.exists::<_, bool>(key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(%key, error = %e, "redis EXISTS failed");
                false
            }
        }
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(reply) => reply == "PONG",
            Err(e) => {
                warn!(error = %e, "redis PING failed");
                false
            }
        }
    }

    /// Execute a caller-built pipeline, decoding the replies as `T`.
    /// Pipelines are scoped to one caller and never shared across tasks.
    pub async fn exec_pipeline<T: FromRedisValue>(&self, pipe: &Pipeline) -> Option<T> {
        let mut conn = self.conn.clone();
        match pipe.query_async::<_, T>(&mut conn).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "redis pipeline failed");
                None
            }
        }
    }
}

#[async_trait]
impl KeyValueCache for CacheClient {
    async fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).await
    }

    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> bool {
        self.set_ex(key, value, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> bool {
        self.del(key).await
    }
}
