//! Two-tier authorization resolver: cache in front of the durable store,
//! with negative caching and stampede protection.

use crate::cache::KeyValueCache;
use crate::models::StreamAuthData;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sentinel cached in place of a record to mean "known absent".
pub const EMPTY_SENTINEL: &str = "__EMPTY__";

/// TTL for confirmed-absent entries.
pub const NEGATIVE_CACHE_TTL_SECS: i64 = 30;

/// TTL installed after a database fault, shielding the store from
/// retry stampedes while staying short enough to recover quickly.
pub const TRANSIENT_DB_ERROR_TTL_SECS: i64 = 5;

#[derive(Debug, Error)]
#[error("auth store query failed: {0}")]
pub struct AuthDbError(pub String);

/// Durable-store lookup seam; the sqlx implementation lives in `crate::db`.
#[async_trait]
pub trait AuthDatabase: Send + Sync {
    async fn fetch_auth_data(
        &self,
        stream_key: &str,
        client_id: &str,
        auth_token: &str,
    ) -> Result<Option<StreamAuthData>, AuthDbError>;
}

#[derive(Debug, Error)]
pub enum AuthRepoError {
    #[error(transparent)]
    Database(#[from] AuthDbError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthRepoStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub sql_hits: u64,
    pub sql_misses: u64,
    pub sql_errors: u64,
    pub validation_failures: u64,
}

impl AuthRepoStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    sql_hits: AtomicU64,
    sql_misses: AtomicU64,
    sql_errors: AtomicU64,
    validation_failures: AtomicU64,
}

pub struct AuthRepository {
    cache: Arc<dyn KeyValueCache>,
    database: Arc<dyn AuthDatabase>,
    cache_ttl_secs: i64,
    counters: Counters,
}

impl AuthRepository {
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        database: Arc<dyn AuthDatabase>,
        cache_ttl_secs: u64,
    ) -> AuthRepository {
        info!(cache_ttl_secs, "auth repository initialized");
        AuthRepository {
            cache,
            database,
            cache_ttl_secs: cache_ttl_secs as i64,
            counters: Counters::default(),
        }
    }

    fn cache_key(stream_key: &str, client_id: &str) -> String {
        format!("auth_data:{}:{}", stream_key, client_id)
    }

    /// Resolve the authorization record for one principal.
    ///
    /// `Ok(None)` means definitively unauthorized (no record, or a stale
    /// cache entry that failed validation); `Err` means the durable store
    /// faulted and the caller should fail closed.
    pub async fn get_auth_data(
        &self,
        stream_key: &str,
        client_id: &str,
        auth_token: &str,
    ) -> Result<Option<StreamAuthData>, AuthRepoError> {
        let cache_key = Self::cache_key(stream_key, client_id);

        match self.cache.get_string(&cache_key).await {
            Some(raw) if raw == EMPTY_SENTINEL => {
                debug!(%stream_key, "auth cache negative hit");
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(raw) => match serde_json::from_str::<StreamAuthData>(&raw) {
                Ok(data) if data.is_valid() => {
                    if data.matches(stream_key, client_id, auth_token) {
                        debug!(%stream_key, "auth cache hit");
                        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(data));
                    }
                    // A cached record for a different principal must never
                    // be returned; drop it and deny.
                    warn!(%stream_key, %client_id, "cached auth record failed validation");
                    self.counters
                        .validation_failures
                        .fetch_add(1, Ordering::Relaxed);
                    self.cache.delete(&cache_key).await;
                    return Ok(None);
                }
                Ok(_) | Err(_) => {
                    warn!(%cache_key, "corrupt auth cache entry, falling through");
                    self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                    self.cache.delete(&cache_key).await;
                }
            },
            None => {
                debug!(%stream_key, "auth cache miss");
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        match self
            .database
            .fetch_auth_data(stream_key, client_id, auth_token)
            .await
        {
            Ok(Some(data)) => {
                self.counters.sql_hits.fetch_add(1, Ordering::Relaxed);
                if let Ok(json) = serde_json::to_string(&data) {
                    self.cache
                        .set_string(&cache_key, &json, self.cache_ttl_secs)
                        .await;
                }
                Ok(Some(data))
            }
            Ok(None) => {
                self.counters.sql_misses.fetch_add(1, Ordering::Relaxed);
                self.cache
                    .set_string(&cache_key, EMPTY_SENTINEL, NEGATIVE_CACHE_TTL_SECS)
                    .await;
                Ok(None)
            }
            Err(e) => {
                warn!(%stream_key, error = %e, "auth database fault");
                self.counters.sql_errors.fetch_add(1, Ordering::Relaxed);
                self.cache
                    .set_string(&cache_key, EMPTY_SENTINEL, TRANSIENT_DB_ERROR_TTL_SECS)
                    .await;
                Err(e.into())
            }
        }
    }

    pub fn stats(&self) -> AuthRepoStats {
        AuthRepoStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            sql_hits: self.counters.sql_hits.load(Ordering::Relaxed),
            sql_misses: self.counters.sql_misses.load(Ordering::Relaxed),
            sql_errors: self.counters.sql_errors.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
        }
    }
}
