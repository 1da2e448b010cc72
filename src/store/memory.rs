//! In-process idempotency cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::store::IdempotencyCache;

/// Entries beyond this count trigger a sweep of expired tokens on write.
const SWEEP_THRESHOLD: usize = 1024;

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct Entry {
    payload: String,
    expires_at: Instant,
}

/// `HashMap`-backed cache. Expiry is checked on read.
pub struct MemoryIdempotencyCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryIdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn insert(&self, entries: &mut HashMap<String, Entry>, token: &str, payload: &str) {
        let now = Instant::now();
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, e| e.expires_at > now);
        }
        entries.insert(
            token.to_string(),
            Entry {
                payload: payload.to_string(),
                expires_at: expiry(now, self.ttl),
            },
        );
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn get(&self, token: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(token)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.payload.clone()))
    }

    async fn put(&self, token: &str, payload: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        self.insert(&mut entries, token, payload);
        Ok(())
    }

    async fn claim(&self, token: &str, payload: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().await;
        let live = entries
            .get(token)
            .is_some_and(|e| e.expires_at > Instant::now());
        if live {
            return Ok(false);
        }
        self.insert(&mut entries, token, payload);
        Ok(true)
    }
}
