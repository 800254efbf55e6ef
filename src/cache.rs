//! Multi-level cache: L1 process memory + L2 persistent store
//!
//! - L1: in-process LRU, fastest, instance-local
//! - L2: shared store tier with native TTLs, visible to every instance
//! - Read-through population and optional fetch-on-miss
//! - Per-data-class TTL strategy from the configured policy
//!
//! The L1 tier is only ever a soft, bounded-staleness optimization: this code
//! runs as independent stateless invocations, so nothing may depend on L1
//! visibility across instances. Invalidation is only guaranteed effective once
//! it reaches L2. Store failures degrade the hit rate, never the caller: a
//! failed L2 read is a miss, a failed L2 write is a logged no-op.

use crate::config::{CacheConfig, TtlPair, TtlPolicy};
use crate::errors::Result;
use crate::schema::keys;
use crate::store::{Command, Reply, Store};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where a lookup was served from. `Miss` covers both "freshly computed" (a
/// fetch function ran) and "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Memory,
    Persistent,
    Miss,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSource::Memory => write!(f, "memory"),
            CacheSource::Persistent => write!(f, "persistent"),
            CacheSource::Miss => write!(f, "miss"),
        }
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub data: Option<serde_json::Value>,
    pub source: CacheSource,
    pub hit: bool,
}

impl CacheLookup {
    fn miss() -> Self {
        Self {
            data: None,
            source: CacheSource::Miss,
            hit: false,
        }
    }
}

/// Tier-skip switches for writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub skip_memory: bool,
    pub skip_store: bool,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: serde_json::Value,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
}

impl MemoryEntry {
    fn new(data: serde_json::Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data,
            inserted_at: now,
            ttl,
            access_count: 0,
            last_accessed: now,
        }
    }

    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Snapshot of the L1 tier for health checks.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub fill_ratio: f64,
}

/// Two-tier cache with per-data-class TTLs and an owned background sweeper.
pub struct MultiLevelCache {
    store: Arc<dyn Store>,
    memory: Mutex<LruCache<String, MemoryEntry>>,
    config: CacheConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    local_hits: AtomicU64,
    local_misses: AtomicU64,
}

impl MultiLevelCache {
    pub fn new(store: Arc<dyn Store>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.l1_capacity)
            .unwrap_or_else(|| NonZeroUsize::new(1_000).expect("nonzero"));
        Self {
            store,
            memory: Mutex::new(LruCache::new(capacity)),
            config,
            sweeper: Mutex::new(None),
            local_hits: AtomicU64::new(0),
            local_misses: AtomicU64::new(0),
        }
    }

    /// The configured TTL policy, for callers picking a data class.
    pub fn policy(&self) -> &TtlPolicy {
        &self.config.ttl
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Look up a key: L1, then L2 (populating L1 on the way back).
    pub async fn get(&self, key: &str, ttl: &TtlPair) -> CacheLookup {
        let started = Instant::now();

        let l1_data = {
            let mut memory = self.memory.lock();
            match memory.get_mut(key) {
                Some(entry) if !entry.is_expired() => {
                    entry.access_count += 1;
                    entry.last_accessed = Instant::now();
                    Some(entry.data.clone())
                }
                Some(_) => {
                    memory.pop(key);
                    None
                }
                None => None,
            }
        };
        if let Some(data) = l1_data {
            self.record_counts(1, 0, started.elapsed()).await;
            return CacheLookup {
                data: Some(data),
                source: CacheSource::Memory,
                hit: true,
            };
        }

        match self.store.get(&keys::cache_multilevel(key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(data) => {
                    self.put_memory(key, data.clone(), ttl.memory_ttl());
                    self.record_counts(1, 0, started.elapsed()).await;
                    return CacheLookup {
                        data: Some(data),
                        source: CacheSource::Persistent,
                        hit: true,
                    };
                }
                Err(e) => {
                    warn!(key, error = %e, "malformed cached payload, treating as miss");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %e, "store read failed, treating as miss");
            }
        }

        self.record_counts(0, 1, started.elapsed()).await;
        CacheLookup::miss()
    }

    /// Look up a key, computing and populating both tiers on miss.
    ///
    /// The fetch closure is the only hook toward the blockchain-read
    /// collaborator; it must be a side-effect-free, idempotent read.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: &TtlPair, fetch: F) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send,
    {
        let lookup = self.get(key, ttl).await;
        if lookup.hit {
            return Ok(lookup);
        }

        let fresh = fetch().await?;
        self.set(key, &fresh, ttl).await;
        Ok(CacheLookup {
            data: Some(fresh),
            source: CacheSource::Miss,
            hit: false,
        })
    }

    /// Serve what L1 can, then fill the remainder with one pipelined L2 read,
    /// populating L1 as a side effect. Absent keys are absent from the result.
    pub async fn batch_get(&self, batch_keys: &[String], ttl: &TtlPair) -> HashMap<String, serde_json::Value> {
        let started = Instant::now();
        let mut results = HashMap::new();
        let mut missing = Vec::new();

        {
            let mut memory = self.memory.lock();
            for key in batch_keys {
                match memory.get_mut(key.as_str()) {
                    Some(entry) if !entry.is_expired() => {
                        entry.access_count += 1;
                        entry.last_accessed = Instant::now();
                        results.insert(key.clone(), entry.data.clone());
                    }
                    _ => missing.push(key.clone()),
                }
            }
        }

        if !missing.is_empty() {
            let commands: Vec<Command> = missing
                .iter()
                .map(|key| Command::Get {
                    key: keys::cache_multilevel(key),
                })
                .collect();
            match self.store.pipeline(commands).await {
                Ok(replies) => {
                    for (key, reply) in missing.iter().zip(replies) {
                        if let Ok(Reply::Value(Some(raw))) = reply {
                            match serde_json::from_str::<serde_json::Value>(&raw) {
                                Ok(data) => {
                                    self.put_memory(key, data.clone(), ttl.memory_ttl());
                                    results.insert(key.clone(), data);
                                }
                                Err(e) => {
                                    warn!(key, error = %e, "malformed cached payload in batch");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "batch store read failed, serving memory hits only");
                }
            }
        }

        let hits = results.len() as u64;
        let misses = batch_keys.len() as u64 - hits;
        self.record_counts(hits, misses, started.elapsed()).await;
        results
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write to both tiers.
    pub async fn set(&self, key: &str, data: &serde_json::Value, ttl: &TtlPair) {
        self.set_with(key, data, ttl, SetOptions::default()).await;
    }

    /// Write to whichever tiers are not skipped.
    pub async fn set_with(
        &self,
        key: &str,
        data: &serde_json::Value,
        ttl: &TtlPair,
        options: SetOptions,
    ) {
        if !options.skip_memory {
            self.put_memory(key, data.clone(), ttl.memory_ttl());
        }
        if !options.skip_store {
            match serde_json::to_string(data) {
                Ok(raw) => {
                    if let Err(e) = self
                        .store
                        .setex(&keys::cache_multilevel(key), ttl.store_ttl_secs, &raw)
                        .await
                    {
                        warn!(key, error = %e, "store cache write failed");
                    }
                }
                Err(e) => {
                    warn!(key, error = %e, "cache payload failed to serialize");
                }
            }
        }
    }

    /// Remove a key from both tiers. Removing an absent key is a no-op, so
    /// invalidation stays idempotent.
    pub async fn delete(&self, key: &str) {
        self.memory.lock().pop(key);
        if let Err(e) = self.store.del(&keys::cache_multilevel(key)).await {
            warn!(key, error = %e, "store cache delete failed");
        }
    }

    /// Drop a single L1 entry without touching L2, for callers batching the
    /// L2 delete into their own pipeline.
    pub fn purge_memory_key(&self, key: &str) {
        self.memory.lock().pop(key);
    }

    /// Drop every L1 entry whose logical key starts with `prefix`. L2 entries
    /// are left to their TTLs; the store offers no efficient pattern delete.
    pub fn purge_memory_prefix(&self, prefix: &str) -> usize {
        let mut memory = self.memory.lock();
        let doomed: Vec<String> = memory
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            memory.pop(key);
        }
        doomed.len()
    }

    // =========================================================================
    // L1 management
    // =========================================================================

    fn put_memory(&self, key: &str, data: serde_json::Value, ttl: Duration) {
        let mut memory = self.memory.lock();
        // LruCache::put evicts the least recently used entry at capacity.
        memory.put(key.to_string(), MemoryEntry::new(data, ttl));
    }

    /// Remove every L1 entry whose age exceeds its own TTL.
    pub fn sweep_expired(&self) -> usize {
        let mut memory = self.memory.lock();
        let doomed: Vec<String> = memory
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            memory.pop(key);
        }
        doomed.len()
    }

    /// Start the periodic expired-entry sweep. The task holds only a weak
    /// reference, so dropping the cache stops it; `shutdown` stops it
    /// explicitly.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired memory cache entries");
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn memory_stats(&self) -> MemoryCacheStats {
        let memory = self.memory.lock();
        let entries = memory.len();
        let capacity = memory.cap().get();
        MemoryCacheStats {
            entries,
            capacity,
            fill_ratio: entries as f64 / capacity as f64,
        }
    }

    /// Process-local hit/miss counters since construction.
    pub fn local_counters(&self) -> (u64, u64) {
        (
            self.local_hits.load(Ordering::Relaxed),
            self.local_misses.load(Ordering::Relaxed),
        )
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    async fn record_counts(&self, hits: u64, misses: u64, elapsed: Duration) {
        self.local_hits.fetch_add(hits, Ordering::Relaxed);
        self.local_misses.fetch_add(misses, Ordering::Relaxed);

        let key = keys::cache_performance();
        let commands = vec![
            Command::HIncrBy {
                key: key.clone(),
                field: "hits".to_string(),
                delta: hits as i64,
            },
            Command::HIncrBy {
                key: key.clone(),
                field: "misses".to_string(),
                delta: misses as i64,
            },
            Command::HIncrBy {
                key: key.clone(),
                field: "total_response_ms".to_string(),
                delta: elapsed.as_millis() as i64,
            },
            Command::HSet {
                key,
                fields: vec![(
                    "last_updated".to_string(),
                    chrono::Utc::now().to_rfc3339(),
                )],
            },
        ];
        if let Err(e) = self.store.pipeline(commands).await {
            debug!(error = %e, "cache metrics update failed");
        }
    }
}

impl Drop for MultiLevelCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
