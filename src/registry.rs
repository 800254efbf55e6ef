//! Trait registry and normalization
//!
//! Registers normalized trait definitions on first sight, tracks usage
//! analytics, computes rarity from live set cardinalities, and answers
//! trait-filter queries by intersecting the trait → tokens reverse indexes.

use crate::entities::{Entities, TraitRecord};
use crate::errors::Result;
use crate::schema::{keys, ContractId, TraitId, TraitValue};
use crate::store::{RangeOrder, Store};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A trait as supplied by callers, before normalization.
#[derive(Debug, Clone)]
pub struct TraitDefinition {
    pub trait_type: String,
    pub value: TraitValue,
    pub display_name: Option<String>,
}

impl TraitDefinition {
    pub fn new(trait_type: impl Into<String>, value: TraitValue) -> Self {
        Self {
            trait_type: trait_type.into(),
            value,
            display_name: None,
        }
    }
}

/// One trait filter in a query: tokens must carry this trait.
#[derive(Debug, Clone)]
pub struct TraitFilter {
    pub trait_type: String,
    pub value: TraitValue,
}

/// Usage statistics for one trait within a contract.
#[derive(Debug, Clone)]
pub struct TraitStats {
    pub trait_id: TraitId,
    pub trait_type: String,
    pub value: String,
    pub count: u64,
    /// Fraction of supply carrying the trait.
    pub rarity: f64,
    pub percentage: f64,
}

/// Scope under which owner pseudo-traits are tracked; they span contracts.
const GLOBAL_SCOPE: &str = "global";

#[derive(Clone)]
pub struct TraitRegistry {
    store: Arc<dyn Store>,
    entities: Entities,
}

impl TraitRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let entities = Entities::new(store.clone());
        Self { store, entities }
    }

    /// Register or fetch a trait definition, tracking its usage under the
    /// contract's analytics.
    pub async fn register_trait(
        &self,
        definition: &TraitDefinition,
        contract: &ContractId,
    ) -> Result<TraitId> {
        let trait_id = TraitId::new(&definition.trait_type, &definition.value)?;

        if self.entities.get_trait(&trait_id).await?.is_none() {
            let record = TraitRecord {
                id: trait_id.clone(),
                value: definition.value.display(),
                display_name: definition
                    .display_name
                    .clone()
                    .unwrap_or_else(|| definition.value.display()),
                category: definition.value.category(),
                rarity: 0.0,
                token_count: 0,
                created_at: Utc::now(),
            };
            self.entities.put_trait(&record).await?;
            debug!(trait_id = %trait_id, "registered new trait");
        }

        self.store
            .zincrby(
                &keys::trait_usage(&contract.to_string()),
                1.0,
                &trait_id.to_string(),
            )
            .await?;

        Ok(trait_id)
    }

    /// Register every trait of a token, bumping per-trait token counts.
    pub async fn register_token_traits(
        &self,
        definitions: &[TraitDefinition],
        contract: &ContractId,
    ) -> Result<Vec<TraitId>> {
        let mut trait_ids = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let trait_id = self.register_trait(definition, contract).await?;
            self.entities.bump_trait_count(&trait_id, 1).await?;
            trait_ids.push(trait_id);
        }
        Ok(trait_ids)
    }

    /// The ownership pseudo-trait for an address, created on first use.
    /// Tracked under the global scope since owners span contracts.
    pub async fn ensure_owner_trait(&self, address: &str) -> Result<TraitId> {
        let trait_id = TraitId::owner(address)?;

        if self.entities.get_trait(&trait_id).await?.is_none() {
            let display = if address.len() > 10 {
                format!("{}...{}", &address[..6], &address[address.len() - 4..])
            } else {
                address.to_string()
            };
            let record = TraitRecord {
                id: trait_id.clone(),
                value: address.to_string(),
                display_name: display,
                category: crate::schema::TraitCategory::Address,
                rarity: 0.0,
                token_count: 0,
                created_at: Utc::now(),
            };
            self.entities.put_trait(&record).await?;
        }

        self.store
            .zincrby(&keys::trait_usage(GLOBAL_SCOPE), 1.0, &trait_id.to_string())
            .await?;

        Ok(trait_id)
    }

    /// All traits of a contract with live counts and rarity, most used first.
    pub async fn contract_trait_stats(&self, contract: &ContractId) -> Result<Vec<TraitStats>> {
        let usage = self
            .store
            .zrange(
                &keys::trait_usage(&contract.to_string()),
                0,
                -1,
                RangeOrder::Descending,
            )
            .await?;
        let total_tokens = self.entities.contract_token_count(contract).await?;

        let mut stats = Vec::with_capacity(usage.len());
        for entry in usage {
            let Ok(trait_id) = entry.member.parse::<TraitId>() else {
                continue;
            };
            let count = self.entities.trait_token_count(&trait_id).await?;
            let rarity = if total_tokens > 0 {
                count as f64 / total_tokens as f64
            } else {
                0.0
            };
            let record = self.entities.get_trait(&trait_id).await?;
            stats.push(TraitStats {
                trait_type: trait_id.trait_type().to_string(),
                value: record
                    .map(|r| r.value)
                    .unwrap_or_else(|| trait_id.normalized_value().to_string()),
                trait_id,
                count,
                rarity,
                percentage: rarity * 100.0,
            });
        }
        Ok(stats)
    }

    /// Recompute and persist rarity on every trait record of a contract.
    pub async fn recalculate_rarities(&self, contract: &ContractId) -> Result<usize> {
        let stats = self.contract_trait_stats(contract).await?;
        let mut updated = 0;
        for stat in &stats {
            if let Some(mut record) = self.entities.get_trait(&stat.trait_id).await? {
                record.rarity = stat.rarity;
                record.token_count = stat.count;
                self.entities.put_trait(&record).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Most used traits of a contract.
    pub async fn popular_traits(&self, contract: &ContractId, limit: usize) -> Result<Vec<TraitStats>> {
        let mut stats = self.contract_trait_stats(contract).await?;
        stats.sort_by(|a, b| b.count.cmp(&a.count));
        stats.truncate(limit);
        Ok(stats)
    }

    /// Tokens carrying ALL of the given traits: the intersection of the
    /// trait → tokens sets, smallest set first. Adding a filter can only
    /// narrow the result.
    pub async fn find_tokens_by_traits(
        &self,
        filters: &[TraitFilter],
        limit: usize,
    ) -> Result<Vec<String>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let mut token_sets: Vec<Vec<String>> = Vec::with_capacity(filters.len());
        for filter in filters {
            let trait_id = TraitId::new(&filter.trait_type, &filter.value)?;
            token_sets.push(self.entities.trait_tokens(&trait_id).await?);
        }

        token_sets.sort_by_key(|set| set.len());

        let mut result: HashSet<String> = token_sets[0].iter().cloned().collect();
        for set in &token_sets[1..] {
            let members: HashSet<&String> = set.iter().collect();
            result.retain(|token| members.contains(token));
            if result.is_empty() {
                break;
            }
        }

        let mut tokens: Vec<String> = result.into_iter().collect();
        tokens.sort();
        tokens.truncate(limit);
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn registry() -> (TraitRegistry, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (TraitRegistry::new(store.clone()), store)
    }

    fn contract() -> ContractId {
        ContractId::new(8453, "0xrug").unwrap()
    }

    #[tokio::test]
    async fn register_creates_record_once() {
        let (registry, _) = registry();
        let def = TraitDefinition::new("palette", TraitValue::Color("Cornell Red".to_string()));

        let first = registry.register_trait(&def, &contract()).await.unwrap();
        let second = registry.register_trait(&def, &contract()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "trait_palette_cornell_red");
    }

    #[tokio::test]
    async fn find_tokens_intersects_filters() {
        let (registry, store) = registry();
        let arctic = TraitId::from_raw("palette", "Arctic").unwrap();
        let gold = TraitId::from_raw("frame", "Gold").unwrap();

        for token in ["1:c:1", "1:c:2", "1:c:3"] {
            store.sadd(&keys::trait_tokens(&arctic), token).await.unwrap();
        }
        for token in ["1:c:2", "1:c:3"] {
            store.sadd(&keys::trait_tokens(&gold), token).await.unwrap();
        }

        let one_filter = vec![TraitFilter {
            trait_type: "palette".to_string(),
            value: TraitValue::Color("Arctic".to_string()),
        }];
        let two_filters = vec![
            TraitFilter {
                trait_type: "palette".to_string(),
                value: TraitValue::Color("Arctic".to_string()),
            },
            TraitFilter {
                trait_type: "frame".to_string(),
                value: TraitValue::Color("Gold".to_string()),
            },
        ];

        let broad = registry.find_tokens_by_traits(&one_filter, 50).await.unwrap();
        let narrow = registry.find_tokens_by_traits(&two_filters, 50).await.unwrap();

        assert_eq!(broad.len(), 3);
        assert_eq!(narrow.len(), 2);
        for token in &narrow {
            assert!(broad.contains(token));
        }
    }

    #[tokio::test]
    async fn owner_trait_abbreviates_display() {
        let (registry, _) = registry();
        let trait_id = registry
            .ensure_owner_trait("0x1234567890abcdef")
            .await
            .unwrap();
        assert_eq!(trait_id.trait_type(), "owner");

        let record = registry
            .entities
            .get_trait(&trait_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.display_name, "0x1234...cdef");
    }

    #[tokio::test]
    async fn stats_compute_rarity_from_supply() {
        let (registry, store) = registry();
        let c = contract();
        let def = TraitDefinition::new("palette", TraitValue::Color("Arctic".to_string()));
        let trait_id = registry.register_trait(&def, &c).await.unwrap();

        // 4-token supply, 2 carrying the trait.
        for n in 1..=4u64 {
            store
                .sadd(&keys::contract_tokens(&c), &format!("8453:0xrug:{n}"))
                .await
                .unwrap();
        }
        for n in 1..=2u64 {
            store
                .sadd(&keys::trait_tokens(&trait_id), &format!("8453:0xrug:{n}"))
                .await
                .unwrap();
        }

        let stats = registry.contract_trait_stats(&c).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 2);
        assert!((stats[0].rarity - 0.5).abs() < f64::EPSILON);
    }
}
