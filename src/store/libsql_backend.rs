//! libSQL idempotency cache.
//!
//! Persists dedup tokens in a local database file so a restarted process
//! still recognises Slack's retried deliveries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::store::IdempotencyCache;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS idempotency (
        token TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency(expires_at);
";

/// libSQL-backed cache. Expiry is a unix timestamp column.
pub struct LibSqlIdempotencyCache {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    ttl: Duration,
}

impl LibSqlIdempotencyCache {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path, ttl: Duration) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to open libSQL database: {e}")))?;
        let cache = Self::from_database(db, ttl).await?;
        info!(path = %path.display(), ttl_secs = ttl.as_secs(), "Idempotency cache opened");
        Ok(cache)
    }

    /// In-memory database (for tests).
    pub async fn new_memory(ttl: Duration) -> Result<Self, CacheError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db, ttl).await
    }

    async fn from_database(db: LibSqlDatabase, ttl: Duration) -> Result<Self, CacheError> {
        let conn = db
            .connect()
            .map_err(|e| CacheError::Backend(format!("Failed to create connection: {e}")))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to create schema: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            ttl,
        })
    }

    fn expires_at(&self, now: i64) -> i64 {
        now.saturating_add(i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX))
    }

    /// Delete expired rows. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM idempotency WHERE expires_at <= ?1",
                params![Utc::now().timestamp()],
            )
            .await
            .map_err(|e| CacheError::Query(format!("purge_expired: {e}")))?;
        if removed > 0 {
            debug!(removed, "Purged expired idempotency tokens");
        }
        Ok(removed)
    }
}

#[async_trait]
impl IdempotencyCache for LibSqlIdempotencyCache {
    async fn get(&self, token: &str) -> Result<Option<String>, CacheError> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM idempotency WHERE token = ?1 AND expires_at > ?2",
                params![token, Utc::now().timestamp()],
            )
            .await
            .map_err(|e| CacheError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| CacheError::Query(format!("get row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(CacheError::Query(format!("get: {e}"))),
        }
    }

    async fn put(&self, token: &str, payload: &str) -> Result<(), CacheError> {
        let now = Utc::now().timestamp();
        self.conn
            .execute(
                "INSERT INTO idempotency (token, payload, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(token) DO UPDATE SET payload = excluded.payload, expires_at = excluded.expires_at",
                params![token, payload, self.expires_at(now)],
            )
            .await
            .map_err(|e| CacheError::Query(format!("put: {e}")))?;
        Ok(())
    }

    async fn claim(&self, token: &str, payload: &str) -> Result<bool, CacheError> {
        let now = Utc::now().timestamp();
        // Only an expired row may be overwritten.
        let changed = self
            .conn
            .execute(
                "INSERT INTO idempotency (token, payload, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(token) DO UPDATE SET payload = excluded.payload, expires_at = excluded.expires_at
                 WHERE idempotency.expires_at <= ?4",
                params![token, payload, self.expires_at(now), now],
            )
            .await
            .map_err(|e| CacheError::Query(format!("claim: {e}")))?;
        Ok(changed > 0)
    }
}
