//! Smart cache invalidation
//!
//! Given a changed entity and a change kind, delete exactly the caches that
//! depend on it. The entity's own cache entry always goes; each change kind
//! adds its dependents:
//!
//! - `metadata`: trait-usage analytics for the contract
//! - `ownership`: ownership analytics (and portfolio caches when the owners
//!   are known)
//! - `maintenance`: maintenance analytics, plus a short-lived
//!   "recently maintained" marker that biases cache warming
//! - `full`: all of the above
//!
//! Contract-wide invalidation cannot enumerate every paginated collection key
//! (the store has no efficient pattern delete), so it marks the contract dirty
//! with a short-TTL sentinel and lets natural TTL expiry finish the sweep.
//! The acceptable staleness window for collection pages is therefore one
//! collection-page TTL after the invalidation.

use crate::cache::MultiLevelCache;
use crate::config::TtlPolicy;
use crate::schema::{keys, ContractId, TokenId};
use crate::store::{Command, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// What changed about the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Metadata,
    Ownership,
    Maintenance,
    Full,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Metadata => write!(f, "metadata"),
            ChangeKind::Ownership => write!(f, "ownership"),
            ChangeKind::Maintenance => write!(f, "maintenance"),
            ChangeKind::Full => write!(f, "full"),
        }
    }
}

/// Outcome of an invalidation pass.
#[derive(Debug, Clone)]
pub struct InvalidationResult {
    pub keys_invalidated: usize,
    pub execution_time_ms: u64,
    pub strategy: String,
}

const RECENT_MAINTENANCE_TTL_SECS: u64 = 3_600;

pub struct SmartInvalidation {
    store: Arc<dyn Store>,
    cache: Arc<MultiLevelCache>,
    /// Sentinel TTL for contract-wide sweeps; bound to the collection-page
    /// store TTL so the staleness window equals one page TTL.
    dirty_sentinel_ttl_secs: u64,
}

impl SmartInvalidation {
    pub fn new(store: Arc<dyn Store>, cache: Arc<MultiLevelCache>, ttl_policy: &TtlPolicy) -> Self {
        Self {
            store,
            cache,
            dirty_sentinel_ttl_secs: ttl_policy.collection_page.store_ttl_secs,
        }
    }

    /// Invalidate a token's caches and its dependents for the given change
    /// kind. Idempotent: re-invalidating an already-absent key is a no-op.
    pub async fn invalidate(&self, token: &TokenId, kind: ChangeKind) -> InvalidationResult {
        let started = Instant::now();
        let contract = token.contract_id();
        let mut keys_invalidated = 0;

        for cache_key in [
            keys::cache_token(token),
            keys::cache_static_metadata(token),
            keys::cache_dynamic(token),
        ] {
            self.cache.delete(&cache_key).await;
            keys_invalidated += 1;
        }

        keys_invalidated += self.invalidate_dependents(token, &contract, kind).await;

        let result = InvalidationResult {
            keys_invalidated,
            execution_time_ms: started.elapsed().as_millis() as u64,
            strategy: format!("token_{kind}_invalidation"),
        };
        debug!(token = %token, kind = %kind, keys = result.keys_invalidated, "invalidated token caches");
        result
    }

    /// Ownership invalidation with the transfer endpoints known: also drops
    /// both portfolio caches instead of only purging by prefix.
    pub async fn invalidate_transfer(
        &self,
        token: &TokenId,
        from: &str,
        to: &str,
    ) -> InvalidationResult {
        let mut result = self.invalidate(token, ChangeKind::Ownership).await;
        for owner in [from, to] {
            self.cache.delete(&keys::cache_owner_portfolio(owner)).await;
            result.keys_invalidated += 1;
        }
        result.strategy = "transfer_invalidation".to_string();
        result
    }

    /// Batch invalidation, grouped by contract to avoid repeating per-contract
    /// analytics deletions.
    pub async fn invalidate_batch(
        &self,
        tokens: &[TokenId],
        kind: ChangeKind,
    ) -> InvalidationResult {
        let started = Instant::now();
        let mut keys_invalidated = 0;

        let mut by_contract: HashMap<String, Vec<&TokenId>> = HashMap::new();
        for token in tokens {
            by_contract
                .entry(token.contract_id().to_string())
                .or_default()
                .push(token);
        }

        for contract_tokens in by_contract.values() {
            for token in contract_tokens {
                for cache_key in [
                    keys::cache_token(token),
                    keys::cache_static_metadata(token),
                    keys::cache_dynamic(token),
                ] {
                    self.cache.delete(&cache_key).await;
                    keys_invalidated += 1;
                }
            }
            // Contract-level dependents once per contract, not once per token.
            if let Some(first) = contract_tokens.first() {
                let contract = first.contract_id();
                keys_invalidated += self
                    .invalidate_contract_dependents(&contract, contract_tokens, kind)
                    .await;
            }
        }

        InvalidationResult {
            keys_invalidated,
            execution_time_ms: started.elapsed().as_millis() as u64,
            strategy: format!("batch_{kind}_invalidation"),
        }
    }

    /// Contract-wide invalidation: every cached token of the contract, the
    /// contract's trait cache, and the dirty sentinel for collection pages.
    pub async fn invalidate_contract(&self, contract: &ContractId) -> InvalidationResult {
        let started = Instant::now();
        let mut keys_invalidated = 0;

        let token_ids = match self.store.smembers(&keys::contract_tokens(contract)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(contract = %contract, error = %e, "could not enumerate contract tokens");
                Vec::new()
            }
        };

        let mut commands = Vec::with_capacity(token_ids.len() + 2);
        for raw_id in &token_ids {
            if let Ok(token) = TokenId::from_str(raw_id) {
                let logical = keys::cache_token(&token);
                self.cache.purge_memory_key(&logical);
                commands.push(Command::Del {
                    key: keys::cache_multilevel(&logical),
                });
                keys_invalidated += 1;
            }
        }
        commands.push(Command::Del {
            key: keys::cache_multilevel(&keys::cache_contract_traits(contract)),
        });
        keys_invalidated += 1;

        // Collection pages cannot be enumerated; mark the contract dirty and
        // let page TTLs finish the sweep.
        commands.push(Command::SetEx {
            key: keys::contract_dirty(contract),
            ttl_secs: self.dirty_sentinel_ttl_secs,
            value: Utc::now().timestamp_millis().to_string(),
        });
        keys_invalidated += 1;

        if let Err(e) = self.store.pipeline(commands).await {
            warn!(contract = %contract, error = %e, "contract invalidation pipeline failed");
        }
        self.cache
            .purge_memory_prefix(&format!("collection:{contract}:"));

        InvalidationResult {
            keys_invalidated,
            execution_time_ms: started.elapsed().as_millis() as u64,
            strategy: "contract_wide_invalidation".to_string(),
        }
    }

    /// Drop a user's portfolio caches and every cached token they own.
    pub async fn invalidate_user(&self, address: &str) -> InvalidationResult {
        let started = Instant::now();
        let mut keys_invalidated = 0;

        let owned = match self.store.smembers(&keys::user_tokens(address)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(user = address, error = %e, "could not enumerate user tokens");
                Vec::new()
            }
        };
        for raw_id in &owned {
            if let Ok(token) = TokenId::from_str(raw_id) {
                self.cache.delete(&keys::cache_token(&token)).await;
                keys_invalidated += 1;
            }
        }
        self.cache.delete(&keys::cache_owner_portfolio(address)).await;
        keys_invalidated += 1;

        InvalidationResult {
            keys_invalidated,
            execution_time_ms: started.elapsed().as_millis() as u64,
            strategy: "user_cache_invalidation".to_string(),
        }
    }

    /// Whether a contract is under a dirty-sentinel sweep.
    pub async fn is_contract_dirty(&self, contract: &ContractId) -> bool {
        matches!(
            self.store.get(&keys::contract_dirty(contract)).await,
            Ok(Some(_))
        )
    }

    // =========================================================================
    // Change-kind dependents
    // =========================================================================

    async fn invalidate_dependents(
        &self,
        token: &TokenId,
        contract: &ContractId,
        kind: ChangeKind,
    ) -> usize {
        let mut commands = Vec::new();

        if matches!(kind, ChangeKind::Metadata | ChangeKind::Full) {
            commands.push(Command::Del {
                key: keys::trait_usage(&contract.to_string()),
            });
        }
        if matches!(kind, ChangeKind::Ownership | ChangeKind::Full) {
            commands.push(Command::Del {
                key: keys::ownership_analytics(contract),
            });
            self.cache.purge_memory_prefix("owner:");
        }
        if matches!(kind, ChangeKind::Maintenance | ChangeKind::Full) {
            commands.push(Command::Del {
                key: keys::maintenance_analytics(contract),
            });
            commands.push(Command::SetEx {
                key: keys::recent_maintenance(token),
                ttl_secs: RECENT_MAINTENANCE_TTL_SECS,
                value: Utc::now().timestamp_millis().to_string(),
            });
        }

        let count = commands.len();
        if !commands.is_empty() {
            if let Err(e) = self.store.pipeline(commands).await {
                warn!(token = %token, error = %e, "dependent invalidation pipeline failed");
            }
        }
        count
    }

    async fn invalidate_contract_dependents(
        &self,
        contract: &ContractId,
        tokens: &[&TokenId],
        kind: ChangeKind,
    ) -> usize {
        let mut commands = Vec::new();

        if matches!(kind, ChangeKind::Metadata | ChangeKind::Full) {
            commands.push(Command::Del {
                key: keys::trait_usage(&contract.to_string()),
            });
        }
        if matches!(kind, ChangeKind::Ownership | ChangeKind::Full) {
            commands.push(Command::Del {
                key: keys::ownership_analytics(contract),
            });
        }
        if matches!(kind, ChangeKind::Maintenance | ChangeKind::Full) {
            commands.push(Command::Del {
                key: keys::maintenance_analytics(contract),
            });
            for token in tokens {
                commands.push(Command::SetEx {
                    key: keys::recent_maintenance(token),
                    ttl_secs: RECENT_MAINTENANCE_TTL_SECS,
                    value: Utc::now().timestamp_millis().to_string(),
                });
            }
        }

        let count = commands.len();
        if !commands.is_empty() {
            if let Err(e) = self.store.pipeline(commands).await {
                warn!(contract = %contract, error = %e, "batch dependent invalidation failed");
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn setup() -> (SmartInvalidation, Arc<MultiLevelCache>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let config = CacheConfig::default();
        let policy = config.ttl.clone();
        let cache = Arc::new(MultiLevelCache::new(store.clone(), config));
        let invalidation = SmartInvalidation::new(store.clone(), cache.clone(), &policy);
        (invalidation, cache, store)
    }

    fn token() -> TokenId {
        TokenId::new(8453, "0xrug", 42).unwrap()
    }

    fn ttl() -> crate::config::TtlPair {
        crate::config::TtlPair {
            store_ttl_secs: 600,
            memory_ttl_secs: 300,
        }
    }

    #[tokio::test]
    async fn invalidate_drops_token_cache() {
        let (invalidation, cache, _) = setup();
        let t = token();
        cache.set(&keys::cache_token(&t), &json!({"owner": "0xa"}), &ttl()).await;

        invalidation.invalidate(&t, ChangeKind::Metadata).await;

        let lookup = cache.get(&keys::cache_token(&t), &ttl()).await;
        assert!(!lookup.hit);
    }

    #[tokio::test]
    async fn maintenance_sets_recent_marker() {
        let (invalidation, _, store) = setup();
        let t = token();

        invalidation.invalidate(&t, ChangeKind::Maintenance).await;

        let marker = store.get(&keys::recent_maintenance(&t)).await.unwrap();
        assert!(marker.is_some());
    }

    #[tokio::test]
    async fn invalidation_is_idempotent() {
        let (invalidation, cache, _) = setup();
        let t = token();
        cache.set(&keys::cache_token(&t), &json!(1), &ttl()).await;

        let first = invalidation.invalidate(&t, ChangeKind::Full).await;
        let second = invalidation.invalidate(&t, ChangeKind::Full).await;

        // Same keys touched both times; the second pass deletes absent keys
        // without error.
        assert_eq!(first.keys_invalidated, second.keys_invalidated);
        assert!(!cache.get(&keys::cache_token(&t), &ttl()).await.hit);
    }

    #[tokio::test]
    async fn contract_invalidation_marks_dirty_with_page_ttl() {
        let (invalidation, _, store) = setup();
        let contract = ContractId::new(8453, "0xrug").unwrap();
        store
            .sadd(&keys::contract_tokens(&contract), &token().to_string())
            .await
            .unwrap();

        invalidation.invalidate_contract(&contract).await;

        assert!(invalidation.is_contract_dirty(&contract).await);
        let remaining = store.ttl_remaining(&keys::contract_dirty(&contract)).unwrap();
        // Sentinel expires with the collection-page TTL (600 s default).
        assert!(remaining.as_secs() <= 600 && remaining.as_secs() > 590);
    }

    #[tokio::test]
    async fn batch_groups_by_contract() {
        let (invalidation, _, store) = setup();
        let t1 = TokenId::new(8453, "0xrug", 1).unwrap();
        let t2 = TokenId::new(8453, "0xrug", 2).unwrap();

        let result = invalidation
            .invalidate_batch(&[t1, t2], ChangeKind::Metadata)
            .await;

        // 3 cache keys per token + one trait-usage delete for the contract.
        assert_eq!(result.keys_invalidated, 7);
        assert!(store
            .get(&keys::trait_usage("8453:0xrug"))
            .await
            .unwrap()
            .is_none());
    }
}
