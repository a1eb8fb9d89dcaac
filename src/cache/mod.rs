//! Short-lived key/value cache used for request-nonce replay protection.

use crate::auth::error::StoreError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How often the in-memory cache sweeps expired keys from its map.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Atomic set-if-absent with expiry.
pub trait NonceCache: Send + Sync {
    /// Store `key` for `ttl` unless a live entry already exists.
    /// Returns `true` when this call created the entry.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Process-local nonce cache. All nodes sharing a signing secret must share
/// one cache for replay protection to hold across them.
///
/// Only expiries are kept; the stored value carries no meaning here.
pub struct MemoryNonceCache {
    inner: Mutex<(HashMap<String, Instant>, Instant)>,
}

impl MemoryNonceCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryNonceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceCache for MemoryNonceCache {
    fn set_if_absent(&self, key: &str, _value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let (entries, last_sweep) = &mut *guard;

        if now.duration_since(*last_sweep) >= SWEEP_INTERVAL {
            entries.retain(|_, expires_at| *expires_at > now);
            *last_sweep = now;
        }

        if entries.get(key).is_some_and(|expires_at| *expires_at > now) {
            return Ok(false);
        }

        entries.insert(key.to_owned(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_set_of_live_key_is_rejected() {
        let cache = MemoryNonceCache::new();
        let ttl = Duration::from_secs(300);
        assert!(cache.set_if_absent("sig:d1:n1", "1", ttl).unwrap());
        assert!(!cache.set_if_absent("sig:d1:n1", "1", ttl).unwrap());
        assert!(cache.set_if_absent("sig:d2:n1", "1", ttl).unwrap());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn key_is_reusable_after_expiry() {
        let cache = MemoryNonceCache::new();
        let ttl = Duration::from_millis(20);
        assert!(cache.set_if_absent("k", "1", ttl).unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.set_if_absent("k", "1", ttl).unwrap());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let cache = MemoryNonceCache::new();
        let winners = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    if cache
                        .set_if_absent("sig:d1:race", "1", Duration::from_secs(60))
                        .unwrap()
                    {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
