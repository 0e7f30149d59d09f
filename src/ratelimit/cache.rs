use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Limiter, Quota};

struct CacheEntry {
    limiter: Limiter,
    /// Milliseconds since the cache origin; refreshed on every lookup.
    last_access_ms: AtomicU64,
}

/// Bounded cache of per-key limiters. The `LruCache` evicts the least
/// recently used entry once the cap is reached; a background sweep drops
/// entries idle longer than `expiration`. Evicting a limiter with no
/// waiters is safe: the next call for that key simply builds a fresh one.
pub struct LimiterCache {
    entries: Mutex<LruCache<String, Arc<CacheEntry>>>,
    expiration: Duration,
    origin: Instant,
}

impl LimiterCache {
    pub fn new(max_size: usize, expiration: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_size.max(1)).expect("max_size is at least 1"),
            )),
            expiration,
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.origin).as_millis() as u64
    }

    /// Fetch the limiter for `key`, creating it from `quota` on first use.
    /// A quota change for an existing key replaces the limiter so stale
    /// windows don't outlive a policy update.
    pub fn get_or_create(&self, key: &str, quota: &Quota) -> CachedLimiter {
        let now = self.now_ms();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = entries.get(key)
            && entry.limiter.quota() == quota
        {
            entry.last_access_ms.store(now, Ordering::Relaxed);
            return CachedLimiter {
                entry: entry.clone(),
            };
        }
        let entry = Arc::new(CacheEntry {
            limiter: Limiter::new(quota.clone()),
            last_access_ms: AtomicU64::new(now),
        });
        entries.put(key.to_string(), entry.clone());
        CachedLimiter { entry }
    }

    /// Remove entries idle for at least the expiration period.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = self
            .now_ms()
            .saturating_sub(self.expiration.as_millis() as u64);
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.last_access_ms.load(Ordering::Relaxed) <= cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        if !stale.is_empty() {
            debug!("rate limiter cache: swept {} idle entr(ies)", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic idle-entry sweep. Stops when `cancel` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
        })
    }
}

/// Handle to a cached limiter; keeps the entry alive even if the cache
/// evicts it while a caller is mid-acquire.
pub struct CachedLimiter {
    entry: Arc<CacheEntry>,
}

impl CachedLimiter {
    pub fn limiter(&self) -> &Limiter {
        &self.entry.limiter
    }
}
