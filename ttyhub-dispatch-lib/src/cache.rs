//! Fingerprint → response cache with per-entry expiry.
//!
//! The cache is a plain expiring map. TTL policy (the RTT-adaptive choice)
//! belongs to the engine; expired entries read as misses and are physically
//! removed by [`ResponseCache::sweep`] on the reaper tick.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CacheEntry {
    data: Bytes,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<u64, CacheEntry>>,
}

impl ResponseCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a live entry. Expired entries are misses; they stay in the
    /// map until the next sweep or overwrite.
    #[must_use]
    pub fn get(&self, fingerprint: u64) -> Option<Bytes> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&fingerprint)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.data.clone())
    }

    /// Insert or overwrite the entry for `fingerprint`.
    pub fn put(&self, fingerprint: u64, data: Bytes, ttl: Duration) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            fingerprint,
            CacheEntry {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove every entry whose expiry has passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| now < entry.expires_at);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
