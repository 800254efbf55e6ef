//! Sorted-set indexes for ranked and range queries
//!
//! Maintains the denormalized indexes over owners, tokens, and traits:
//! - Owner token counts (relative increments) and activity (absolute timestamps)
//! - Token dirt, aging (absolute levels) and maintenance recency (timestamps)
//! - Trait popularity (relative increments)
//! - Owner → trait composite index
//!
//! Score semantics matter: count-like indexes move by increments so concurrent
//! writers compose; level and timestamp indexes overwrite with absolute values
//! so the latest write wins.

use crate::entities::Entities;
use crate::errors::{Result, StoreResult};
use crate::schema::{keys, ContractId, TokenId, TraitId};
use crate::store::{Command, RangeOrder, ScoredMember, Store};
use chrono::Utc;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct IndexManager {
    store: Arc<dyn Store>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Relative: owner gained or lost `delta` tokens.
    pub async fn bump_owner_token_count(
        &self,
        contract: &ContractId,
        owner: &str,
        delta: i64,
    ) -> StoreResult<f64> {
        self.store
            .zincrby(&keys::owners_by_token_count(contract), delta as f64, owner)
            .await
    }

    /// Absolute: overwrite the owner's last-action timestamp.
    pub async fn touch_owner_activity(
        &self,
        contract: &ContractId,
        owner: &str,
        timestamp_ms: i64,
    ) -> StoreResult<()> {
        self.store
            .zadd(&keys::owners_by_activity(contract), timestamp_ms as f64, owner)
            .await
    }

    /// Absolute: overwrite the token's dirt level.
    pub async fn set_dirt_level(
        &self,
        contract: &ContractId,
        token: &TokenId,
        level: u32,
    ) -> StoreResult<()> {
        self.store
            .zadd(
                &keys::tokens_by_dirt_level(contract),
                level as f64,
                &token.to_string(),
            )
            .await
    }

    /// Absolute: overwrite the token's aging level.
    pub async fn set_aging_level(
        &self,
        contract: &ContractId,
        token: &TokenId,
        level: u32,
    ) -> StoreResult<()> {
        self.store
            .zadd(
                &keys::tokens_by_aging_level(contract),
                level as f64,
                &token.to_string(),
            )
            .await
    }

    /// Absolute: overwrite the token's last-maintenance timestamp.
    pub async fn touch_maintenance(
        &self,
        contract: &ContractId,
        token: &TokenId,
        timestamp_ms: i64,
    ) -> StoreResult<()> {
        self.store
            .zadd(
                &keys::tokens_by_maintenance(contract),
                timestamp_ms as f64,
                &token.to_string(),
            )
            .await
    }

    /// Relative: trait usage moved by `delta`.
    pub async fn bump_trait_popularity(
        &self,
        contract: &ContractId,
        trait_id: &TraitId,
        delta: i64,
    ) -> StoreResult<f64> {
        self.store
            .zincrby(
                &keys::traits_by_popularity(contract),
                delta as f64,
                &trait_id.to_string(),
            )
            .await
    }

    /// Record that an owner holds a token with this trait.
    pub async fn record_owner_trait(
        &self,
        contract: &ContractId,
        owner: &str,
        trait_id: &TraitId,
        timestamp_ms: i64,
    ) -> StoreResult<()> {
        self.store
            .zadd(
                &keys::owner_trait_composite(contract, owner),
                timestamp_ms as f64,
                &trait_id.to_string(),
            )
            .await
    }

    // =========================================================================
    // Pipeline command builders
    // =========================================================================

    pub fn bump_owner_count_cmd(contract: &ContractId, owner: &str, delta: i64) -> Command {
        Command::ZIncrBy {
            key: keys::owners_by_token_count(contract),
            delta: delta as f64,
            member: owner.to_string(),
        }
    }

    pub fn touch_activity_cmd(contract: &ContractId, owner: &str, timestamp_ms: i64) -> Command {
        Command::ZAdd {
            key: keys::owners_by_activity(contract),
            score: timestamp_ms as f64,
            member: owner.to_string(),
        }
    }

    pub fn set_dirt_cmd(contract: &ContractId, token: &TokenId, level: u32) -> Command {
        Command::ZAdd {
            key: keys::tokens_by_dirt_level(contract),
            score: level as f64,
            member: token.to_string(),
        }
    }

    pub fn set_aging_cmd(contract: &ContractId, token: &TokenId, level: u32) -> Command {
        Command::ZAdd {
            key: keys::tokens_by_aging_level(contract),
            score: level as f64,
            member: token.to_string(),
        }
    }

    pub fn touch_maintenance_cmd(contract: &ContractId, token: &TokenId, timestamp_ms: i64) -> Command {
        Command::ZAdd {
            key: keys::tokens_by_maintenance(contract),
            score: timestamp_ms as f64,
            member: token.to_string(),
        }
    }

    pub fn bump_popularity_cmd(contract: &ContractId, trait_id: &TraitId, delta: i64) -> Command {
        Command::ZIncrBy {
            key: keys::traits_by_popularity(contract),
            delta: delta as f64,
            member: trait_id.to_string(),
        }
    }

    pub fn record_owner_trait_cmd(
        contract: &ContractId,
        owner: &str,
        trait_id: &TraitId,
        timestamp_ms: i64,
    ) -> Command {
        Command::ZAdd {
            key: keys::owner_trait_composite(contract, owner),
            score: timestamp_ms as f64,
            member: trait_id.to_string(),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn top_owners_by_count(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(
                &keys::owners_by_token_count(contract),
                0,
                n as i64 - 1,
                RangeOrder::Descending,
            )
            .await
    }

    pub async fn most_active_owners(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(
                &keys::owners_by_activity(contract),
                0,
                n as i64 - 1,
                RangeOrder::Descending,
            )
            .await
    }

    pub async fn dirtiest_tokens(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(
                &keys::tokens_by_dirt_level(contract),
                0,
                n as i64 - 1,
                RangeOrder::Descending,
            )
            .await
    }

    pub async fn most_aged_tokens(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(
                &keys::tokens_by_aging_level(contract),
                0,
                n as i64 - 1,
                RangeOrder::Descending,
            )
            .await
    }

    /// Tokens whose dirt level falls within `[min, max]`.
    pub async fn tokens_by_dirt_range(
        &self,
        contract: &ContractId,
        min: u32,
        max: u32,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange_by_score(&keys::tokens_by_dirt_level(contract), min as f64, max as f64)
            .await
    }

    pub async fn recently_maintained(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(
                &keys::tokens_by_maintenance(contract),
                0,
                n as i64 - 1,
                RangeOrder::Descending,
            )
            .await
    }

    /// Union of the top-N dirtiest and most-aged tokens, deduplicated.
    ///
    /// This is a heuristic shortlist, not an exact "needs maintenance"
    /// predicate: a token can sit just below both cut-offs and still need
    /// attention, and dirt and aging are weighted equally.
    pub async fn tokens_needing_maintenance(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<String>> {
        let dirty = self.dirtiest_tokens(contract, n).await?;
        let aged = self.most_aged_tokens(contract, n).await?;

        let mut seen = HashSet::new();
        let mut combined = Vec::new();
        for entry in dirty.into_iter().chain(aged) {
            if seen.insert(entry.member.clone()) {
                combined.push(entry.member);
            }
        }
        combined.truncate(n);
        Ok(combined)
    }

    pub async fn popular_traits(
        &self,
        contract: &ContractId,
        n: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(
                &keys::traits_by_popularity(contract),
                0,
                n as i64 - 1,
                RangeOrder::Descending,
            )
            .await
    }

    pub async fn owner_traits(&self, contract: &ContractId, owner: &str) -> StoreResult<Vec<String>> {
        let entries = self
            .store
            .zrange(
                &keys::owner_trait_composite(contract, owner),
                0,
                -1,
                RangeOrder::Ascending,
            )
            .await?;
        Ok(entries.into_iter().map(|e| e.member).collect())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Clear and reconstruct every per-contract index by walking the
    /// contract's token set. Heavy; intended for operational repair.
    pub async fn rebuild_contract_indexes(
        &self,
        contract: &ContractId,
        entities: &Entities,
    ) -> Result<usize> {
        info!(contract = %contract, "rebuilding contract indexes");

        for key in [
            keys::owners_by_token_count(contract),
            keys::owners_by_activity(contract),
            keys::tokens_by_dirt_level(contract),
            keys::tokens_by_aging_level(contract),
            keys::tokens_by_maintenance(contract),
            keys::traits_by_popularity(contract),
        ] {
            self.store.del(&key).await?;
        }

        let token_ids = entities.contract_tokens(contract).await?;
        let now_ms = Utc::now().timestamp_millis();
        let mut rebuilt = 0;

        for raw_id in &token_ids {
            let Ok(token_id) = TokenId::from_str(raw_id) else {
                debug!(token = %raw_id, "skipping malformed token id during rebuild");
                continue;
            };
            let Some(token) = entities.get_token(&token_id).await? else {
                debug!(token = %raw_id, "token in contract set has no record");
                continue;
            };

            let mut commands = vec![
                Self::bump_owner_count_cmd(contract, &token.owner, 1),
                Self::touch_activity_cmd(contract, &token.owner, now_ms),
                Self::set_dirt_cmd(contract, &token_id, token.dynamic.dirt_level),
                Self::set_aging_cmd(contract, &token_id, token.dynamic.aging_level),
            ];
            if let Some(last) = token.dynamic.last_maintenance {
                commands.push(Self::touch_maintenance_cmd(
                    contract,
                    &token_id,
                    last.timestamp_millis(),
                ));
            }
            for trait_id in &token.traits {
                commands.push(Self::bump_popularity_cmd(contract, trait_id, 1));
                commands.push(Self::record_owner_trait_cmd(
                    contract,
                    &token.owner,
                    trait_id,
                    now_ms,
                ));
            }
            self.store.pipeline(commands).await?;
            rebuilt += 1;
        }

        info!(contract = %contract, tokens = rebuilt, "index rebuild complete");
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn contract() -> ContractId {
        ContractId::new(8453, "0xrug").unwrap()
    }

    #[tokio::test]
    async fn owner_count_uses_relative_increments() {
        let indexes = IndexManager::new(Arc::new(InMemoryStore::new()));
        let c = contract();

        indexes.bump_owner_token_count(&c, "0xa", 3).await.unwrap();
        indexes.bump_owner_token_count(&c, "0xa", -1).await.unwrap();
        indexes.bump_owner_token_count(&c, "0xb", 1).await.unwrap();

        let top = indexes.top_owners_by_count(&c, 2).await.unwrap();
        assert_eq!(top[0].member, "0xa");
        assert_eq!(top[0].score, 2.0);
        assert_eq!(top[1].member, "0xb");
    }

    #[tokio::test]
    async fn activity_uses_absolute_timestamps() {
        let indexes = IndexManager::new(Arc::new(InMemoryStore::new()));
        let c = contract();

        indexes.touch_owner_activity(&c, "0xa", 1_000).await.unwrap();
        indexes.touch_owner_activity(&c, "0xa", 5_000).await.unwrap();

        let active = indexes.most_active_owners(&c, 1).await.unwrap();
        assert_eq!(active[0].score, 5_000.0);
    }

    #[tokio::test]
    async fn maintenance_shortlist_unions_and_dedupes() {
        let indexes = IndexManager::new(Arc::new(InMemoryStore::new()));
        let c = contract();
        let t1 = TokenId::new(8453, "0xrug", 1).unwrap();
        let t2 = TokenId::new(8453, "0xrug", 2).unwrap();
        let t3 = TokenId::new(8453, "0xrug", 3).unwrap();

        // t1 is both dirty and aged; t2 only dirty; t3 only aged.
        indexes.set_dirt_level(&c, &t1, 90).await.unwrap();
        indexes.set_dirt_level(&c, &t2, 80).await.unwrap();
        indexes.set_aging_level(&c, &t1, 70).await.unwrap();
        indexes.set_aging_level(&c, &t3, 60).await.unwrap();

        let shortlist = indexes.tokens_needing_maintenance(&c, 10).await.unwrap();
        assert_eq!(shortlist.len(), 3);
        assert!(shortlist.contains(&t1.to_string()));
        assert!(shortlist.contains(&t2.to_string()));
        assert!(shortlist.contains(&t3.to_string()));
    }

    #[tokio::test]
    async fn dirt_range_query() {
        let indexes = IndexManager::new(Arc::new(InMemoryStore::new()));
        let c = contract();
        for (n, level) in [(1u64, 10u32), (2, 50), (3, 95)] {
            let t = TokenId::new(8453, "0xrug", n).unwrap();
            indexes.set_dirt_level(&c, &t, level).await.unwrap();
        }

        let mid = indexes.tokens_by_dirt_range(&c, 20, 90).await.unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].score, 50.0);
    }
}
