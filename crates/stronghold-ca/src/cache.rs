//! Certificate cache (§3, §4.2, §9): a sharded, read-mostly map from host name to
//! leaf certificate, with LRU eviction, a TTL sweep, and single-flight minting so
//! concurrent first-time lookups for the same host never mint more than once.

use crate::authority::{CaError, LeafCertificate, RootCa};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

struct CacheEntry {
    leaf: Arc<LeafCertificate>,
    created_at: Instant,
    last_used_at: Instant,
}

pub struct CertCache {
    ca: Arc<RootCa>,
    entries: DashMap<String, CacheEntry>,
    /// One mutex per host currently being minted, so waiters block instead of
    /// racing the root CA (§4.2 "one winner stores and all waiters receive it").
    inflight: DashMap<String, Arc<AsyncMutex<()>>>,
    max_size: usize,
    ttl: Duration,
}

impl CertCache {
    pub fn new(ca: Arc<RootCa>, max_size: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ca,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            max_size,
            ttl,
        })
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Returns a cached leaf for `host` if present and unexpired, otherwise mints,
    /// caches, and returns a fresh one.
    pub async fn get_cert(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        if let Some(mut entry) = self.entries.get_mut(host) {
            if entry.created_at.elapsed() < self.ttl {
                entry.last_used_at = Instant::now();
                return Ok(Arc::clone(&entry.leaf));
            }
        }

        let lock = Arc::clone(
            self.inflight
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        let _guard = lock.lock().await;

        // Re-check: another task may have minted and inserted while we waited on the lock.
        if let Some(mut entry) = self.entries.get_mut(host) {
            if entry.created_at.elapsed() < self.ttl {
                entry.last_used_at = Instant::now();
                self.inflight.remove(host);
                return Ok(Arc::clone(&entry.leaf));
            }
        }

        let leaf = Arc::new(self.ca.issue_leaf(host)?);
        let now = Instant::now();
        self.entries.insert(
            host.to_string(),
            CacheEntry {
                leaf: Arc::clone(&leaf),
                created_at: now,
                last_used_at: now,
            },
        );
        self.evict_if_over_capacity();
        self.inflight.remove(host);
        Ok(leaf)
    }

    /// On insert, if size would exceed `max_size`, synchronously evicts LRU entries
    /// down to `floor(3/4 * max_size)` (§4.2).
    fn evict_if_over_capacity(&self) {
        if self.entries.len() <= self.max_size {
            return;
        }
        let target = (self.max_size * 3) / 4;
        let mut by_recency: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_used_at))
            .collect();
        by_recency.sort_by_key(|(_, last_used)| *last_used);

        let to_evict = self.entries.len().saturating_sub(target);
        for (host, _) in by_recency.into_iter().take(to_evict) {
            self.entries.remove(&host);
        }
    }

    /// Removes entries whose age exceeds the TTL. Intended to run on a periodic
    /// background task (§4.2).
    fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
    }

    /// Spawns the background eviction-interval sweep task; stops when `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let before = cache.size();
                        cache.sweep_expired();
                        let removed = before - cache.size();
                        if removed > 0 {
                            tracing::debug!(removed, "cert cache TTL sweep removed expired entries");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("cert cache sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tempdir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("stronghold-ca-cache-test-{tag}-{}", std::process::id()));
        p
    }

    #[tokio::test]
    async fn concurrent_first_lookups_mint_once() {
        let dir = tempdir("single-mint");
        let ca = Arc::new(RootCa::load_or_generate(&dir).unwrap());
        let cache = CertCache::new(ca, 1024, Duration::from_secs(3600));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(
                async move { cache.get_cert("fresh.example.test").await.unwrap() },
            ));
        }
        let mut leaves = Vec::new();
        for h in handles {
            leaves.push(h.await.unwrap());
        }
        let first = Arc::as_ptr(&leaves[0]);
        assert!(leaves.iter().all(|l| Arc::as_ptr(l) == first));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn eviction_bounds_size_to_three_quarters() {
        let dir = tempdir("eviction");
        let ca = Arc::new(RootCa::load_or_generate(&dir).unwrap());
        let cache = CertCache::new(ca, 8, Duration::from_secs(3600));

        for i in 0..12 {
            cache.get_cert(&format!("host-{i}.example.test")).await.unwrap();
        }
        assert!(cache.size() <= 6);

        std::fs::remove_dir_all(&dir).ok();
    }
}
