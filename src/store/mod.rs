//! Duplicate-delivery suppression.
//!
//! Slack retries an event when the first delivery is not acknowledged fast
//! enough. The server records each message's `client_msg_id` here before
//! starting the pipeline and drops deliveries it has already seen.

pub mod libsql_backend;
pub mod memory;

pub use libsql_backend::LibSqlIdempotencyCache;
pub use memory::MemoryIdempotencyCache;

use async_trait::async_trait;

use crate::error::CacheError;

/// Token → payload store with expiry.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Stored payload for an unexpired token.
    async fn get(&self, token: &str) -> Result<Option<String>, CacheError>;

    /// Store `payload` under `token`, replacing any previous entry.
    async fn put(&self, token: &str, payload: &str) -> Result<(), CacheError>;

    /// Record `token` if it is unseen or expired. Returns `true` when this
    /// call recorded it, `false` for a duplicate.
    async fn claim(&self, token: &str, payload: &str) -> Result<bool, CacheError> {
        if self.get(token).await?.is_some() {
            return Ok(false);
        }
        self.put(token, payload).await?;
        Ok(true)
    }
}
