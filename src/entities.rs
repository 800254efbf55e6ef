//! Entity records and CRUD over the persistent store
//!
//! Token, Contract, Trait, and User records live in store hashes; their
//! relationships live in sets. Nothing here is transactional on its own;
//! multi-step business operations are composed by the atomic orchestrator,
//! which batches the same writes into pipelines.

use crate::errors::{Result, SerializationError, StoreResult};
use crate::schema::{keys, ContractId, TokenId, TraitCategory, TraitId};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable per-token state. Changes over the token's life through maintenance
/// actions; everything else on a token is fixed at mint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicState {
    pub dirt_level: u32,
    pub aging_level: u32,
    pub maintenance_count: u32,
    pub cleaning_count: u32,
    pub restoration_count: u32,
    pub last_maintenance: Option<DateTime<Utc>>,
    pub last_cleaning: Option<DateTime<Utc>>,
}

/// Canonical per-token record.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub id: TokenId,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub image: String,
    pub animation_url: String,
    /// Static traits, set once at mint.
    pub traits: Vec<TraitId>,
    pub dynamic: DynamicState,
    pub metadata_hash: String,
    pub last_refresh: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Collection-level record.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractRecord {
    pub id: ContractId,
    pub name: String,
    pub symbol: String,
    pub total_supply: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized trait definition record.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitRecord {
    pub id: TraitId,
    pub value: String,
    pub display_name: String,
    pub category: TraitCategory,
    /// Fraction of supply carrying this trait.
    pub rarity: f64,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

/// User profile record.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub address: String,
    pub nft_count: i64,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 over the immutable metadata of a token.
pub fn compute_metadata_hash(
    name: &str,
    description: &str,
    image: &str,
    animation_url: &str,
    traits: &[TraitId],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(description.as_bytes());
    hasher.update(image.as_bytes());
    hasher.update(animation_url.as_bytes());
    for trait_id in traits {
        hasher.update(trait_id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn decode_err(key: &str, field: &str) -> SerializationError {
    SerializationError::MalformedField {
        key: key.to_string(),
        field: field.to_string(),
    }
}

fn parse_timestamp(key: &str, field: &str, raw: &str) -> std::result::Result<DateTime<Utc>, SerializationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| decode_err(key, field))
}

/// CRUD over entity records and their relationship sets.
#[derive(Clone)]
pub struct Entities {
    store: Arc<dyn Store>,
}

impl Entities {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// Hash fields for a token record, shared by direct puts and pipelined
    /// writes.
    pub fn token_fields(token: &TokenRecord) -> Result<Vec<(String, String)>> {
        let traits: Vec<String> = token.traits.iter().map(|t| t.to_string()).collect();
        let traits_json = serde_json::to_string(&traits).map_err(|e| SerializationError::Encode {
            context: "token.traits".to_string(),
            reason: e.to_string(),
        })?;
        let dynamic_json =
            serde_json::to_string(&token.dynamic).map_err(|e| SerializationError::Encode {
                context: "token.dynamic".to_string(),
                reason: e.to_string(),
            })?;
        Ok(vec![
            ("id".to_string(), token.id.to_string()),
            ("contract_id".to_string(), token.id.contract_id().to_string()),
            ("token_number".to_string(), token.id.token_number().to_string()),
            ("owner".to_string(), token.owner.clone()),
            ("name".to_string(), token.name.clone()),
            ("description".to_string(), token.description.clone()),
            ("image".to_string(), token.image.clone()),
            ("animation_url".to_string(), token.animation_url.clone()),
            ("traits".to_string(), traits_json),
            ("dynamic".to_string(), dynamic_json),
            ("metadata_hash".to_string(), token.metadata_hash.clone()),
            ("last_refresh".to_string(), token.last_refresh.to_rfc3339()),
            ("created_at".to_string(), token.created_at.to_rfc3339()),
        ])
    }

    pub async fn put_token(&self, token: &TokenRecord) -> Result<()> {
        let key = keys::token(&token.id);
        let fields = Self::token_fields(token)?;
        self.store.hset(&key, &fields).await?;
        Ok(())
    }

    pub async fn get_token(&self, id: &TokenId) -> Result<Option<TokenRecord>> {
        let key = keys::token(id);
        let map = self.store.hgetall(&key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::token_from_hash(&key, id, &map)?))
    }

    pub fn token_from_hash(
        key: &str,
        id: &TokenId,
        map: &HashMap<String, String>,
    ) -> std::result::Result<TokenRecord, SerializationError> {
        let field = |name: &str| map.get(name).cloned().ok_or_else(|| decode_err(key, name));

        let traits_raw = field("traits")?;
        let trait_strings: Vec<String> =
            serde_json::from_str(&traits_raw).map_err(|_| decode_err(key, "traits"))?;
        let traits = trait_strings
            .iter()
            .map(|s| s.parse::<TraitId>().map_err(|_| decode_err(key, "traits")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let dynamic_raw = field("dynamic")?;
        let dynamic: DynamicState =
            serde_json::from_str(&dynamic_raw).map_err(|_| decode_err(key, "dynamic"))?;

        Ok(TokenRecord {
            id: id.clone(),
            owner: field("owner")?,
            name: map.get("name").cloned().unwrap_or_default(),
            description: map.get("description").cloned().unwrap_or_default(),
            image: map.get("image").cloned().unwrap_or_default(),
            animation_url: map.get("animation_url").cloned().unwrap_or_default(),
            traits,
            dynamic,
            metadata_hash: map.get("metadata_hash").cloned().unwrap_or_default(),
            last_refresh: parse_timestamp(key, "last_refresh", &field("last_refresh")?)?,
            created_at: parse_timestamp(key, "created_at", &field("created_at")?)?,
        })
    }

    // =========================================================================
    // Contracts
    // =========================================================================

    pub async fn put_contract(&self, contract: &ContractRecord) -> Result<()> {
        let key = keys::contract(&contract.id);
        let fields = vec![
            ("id".to_string(), contract.id.to_string()),
            ("chain_id".to_string(), contract.id.chain_id().to_string()),
            ("address".to_string(), contract.id.address().to_string()),
            ("name".to_string(), contract.name.clone()),
            ("symbol".to_string(), contract.symbol.clone()),
            ("total_supply".to_string(), contract.total_supply.to_string()),
            ("created_at".to_string(), contract.created_at.to_rfc3339()),
            ("updated_at".to_string(), contract.updated_at.to_rfc3339()),
        ];
        self.store.hset(&key, &fields).await?;
        Ok(())
    }

    pub async fn get_contract(&self, id: &ContractId) -> Result<Option<ContractRecord>> {
        let key = keys::contract(id);
        let map = self.store.hgetall(&key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| map.get(name).cloned().ok_or_else(|| decode_err(&key, name));
        Ok(Some(ContractRecord {
            id: id.clone(),
            name: map.get("name").cloned().unwrap_or_default(),
            symbol: map.get("symbol").cloned().unwrap_or_default(),
            total_supply: field("total_supply")?
                .parse()
                .map_err(|_| decode_err(&key, "total_supply"))?,
            created_at: parse_timestamp(&key, "created_at", &field("created_at")?)?,
            updated_at: parse_timestamp(&key, "updated_at", &field("updated_at")?)?,
        }))
    }

    /// Adjust the cached total supply, e.g. after a batch mint.
    pub async fn bump_total_supply(&self, id: &ContractId, delta: i64) -> Result<i64> {
        let key = keys::contract(id);
        let next = self.store.hincrby(&key, "total_supply", delta).await?;
        self.store
            .hset(&key, &[("updated_at".to_string(), Utc::now().to_rfc3339())])
            .await?;
        Ok(next)
    }

    pub async fn contract_tokens(&self, id: &ContractId) -> StoreResult<Vec<String>> {
        self.store.smembers(&keys::contract_tokens(id)).await
    }

    pub async fn contract_token_count(&self, id: &ContractId) -> StoreResult<u64> {
        self.store.scard(&keys::contract_tokens(id)).await
    }

    // =========================================================================
    // Traits
    // =========================================================================

    pub async fn put_trait(&self, record: &TraitRecord) -> Result<()> {
        let key = keys::trait_record(&record.id);
        let fields = vec![
            ("id".to_string(), record.id.to_string()),
            ("type".to_string(), record.id.trait_type().to_string()),
            ("value".to_string(), record.value.clone()),
            (
                "normalized_value".to_string(),
                record.id.normalized_value().to_string(),
            ),
            ("display_name".to_string(), record.display_name.clone()),
            ("category".to_string(), record.category.to_string()),
            ("rarity".to_string(), record.rarity.to_string()),
            ("token_count".to_string(), record.token_count.to_string()),
            ("created_at".to_string(), record.created_at.to_rfc3339()),
        ];
        self.store.hset(&key, &fields).await?;
        Ok(())
    }

    pub async fn get_trait(&self, id: &TraitId) -> Result<Option<TraitRecord>> {
        let key = keys::trait_record(id);
        let map = self.store.hgetall(&key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| map.get(name).cloned().ok_or_else(|| decode_err(&key, name));
        let category = match map.get("category").map(String::as_str) {
            Some("color") => TraitCategory::Color,
            Some("numeric") => TraitCategory::Numeric,
            Some("address") => TraitCategory::Address,
            Some("boolean") => TraitCategory::Boolean,
            _ => TraitCategory::Text,
        };
        Ok(Some(TraitRecord {
            id: id.clone(),
            value: map.get("value").cloned().unwrap_or_default(),
            display_name: map.get("display_name").cloned().unwrap_or_default(),
            category,
            rarity: map
                .get("rarity")
                .and_then(|r| r.parse().ok())
                .unwrap_or(0.0),
            token_count: field("token_count")?
                .parse()
                .map_err(|_| decode_err(&key, "token_count"))?,
            created_at: parse_timestamp(&key, "created_at", &field("created_at")?)?,
        }))
    }

    pub async fn bump_trait_count(&self, id: &TraitId, delta: i64) -> StoreResult<i64> {
        self.store
            .hincrby(&keys::trait_record(id), "token_count", delta)
            .await
    }

    pub async fn trait_tokens(&self, id: &TraitId) -> StoreResult<Vec<String>> {
        self.store.smembers(&keys::trait_tokens(id)).await
    }

    pub async fn trait_token_count(&self, id: &TraitId) -> StoreResult<u64> {
        self.store.scard(&keys::trait_tokens(id)).await
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn put_user(&self, user: &UserRecord) -> Result<()> {
        let key = keys::user(&user.address);
        let fields = vec![
            ("id".to_string(), user.address.clone()),
            ("address".to_string(), user.address.clone()),
            ("nft_count".to_string(), user.nft_count.to_string()),
            ("last_activity".to_string(), user.last_activity.to_rfc3339()),
            ("created_at".to_string(), user.created_at.to_rfc3339()),
        ];
        self.store.hset(&key, &fields).await?;
        Ok(())
    }

    pub async fn get_user(&self, address: &str) -> Result<Option<UserRecord>> {
        let key = keys::user(address);
        let map = self.store.hgetall(&key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| map.get(name).cloned().ok_or_else(|| decode_err(&key, name));
        Ok(Some(UserRecord {
            address: address.to_string(),
            nft_count: map
                .get("nft_count")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            last_activity: parse_timestamp(&key, "last_activity", &field("last_activity")?)?,
            created_at: parse_timestamp(&key, "created_at", &field("created_at")?)?,
        }))
    }

    pub async fn add_token_to_user(&self, address: &str, token: &TokenId) -> StoreResult<()> {
        self.store
            .sadd(&keys::user_tokens(address), &token.to_string())
            .await?;
        self.store
            .hincrby(&keys::user(address), "nft_count", 1)
            .await?;
        Ok(())
    }

    pub async fn remove_token_from_user(&self, address: &str, token: &TokenId) -> StoreResult<()> {
        self.store
            .srem(&keys::user_tokens(address), &token.to_string())
            .await?;
        self.store
            .hincrby(&keys::user(address), "nft_count", -1)
            .await?;
        Ok(())
    }

    pub async fn user_tokens(&self, address: &str) -> StoreResult<Vec<String>> {
        self.store.smembers(&keys::user_tokens(address)).await
    }

    pub async fn user_owns(&self, address: &str, token: &TokenId) -> StoreResult<bool> {
        self.store
            .sismember(&keys::user_tokens(address), &token.to_string())
            .await
    }

    // =========================================================================
    // Generic relationship helpers
    // =========================================================================

    pub async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.store.sadd(key, member).await
    }

    pub async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.store.srem(key, member).await
    }

    pub async fn is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.store.sismember(key, member).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TraitValue;
    use crate::store::InMemoryStore;

    fn sample_token() -> TokenRecord {
        let id = TokenId::new(8453, "0xabc", 1).unwrap();
        let traits = vec![
            TraitId::new("palette", &TraitValue::Color("Cornell Red".to_string())).unwrap(),
            TraitId::new("complexity", &TraitValue::Numeric(2)).unwrap(),
        ];
        let metadata_hash = compute_metadata_hash("Rug #1", "A rug", "ipfs://img", "", &traits);
        TokenRecord {
            id,
            owner: "0xowner".to_string(),
            name: "Rug #1".to_string(),
            description: "A rug".to_string(),
            image: "ipfs://img".to_string(),
            animation_url: String::new(),
            traits,
            dynamic: DynamicState::default(),
            metadata_hash,
            last_refresh: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn token_round_trip() {
        let entities = Entities::new(Arc::new(InMemoryStore::new()));
        let token = sample_token();
        entities.put_token(&token).await.unwrap();

        let loaded = entities.get_token(&token.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner, token.owner);
        assert_eq!(loaded.traits, token.traits);
        assert_eq!(loaded.dynamic, token.dynamic);
        assert_eq!(loaded.metadata_hash, token.metadata_hash);
    }

    #[tokio::test]
    async fn missing_token_is_none() {
        let entities = Entities::new(Arc::new(InMemoryStore::new()));
        let id = TokenId::new(1, "0xdead", 9).unwrap();
        assert!(entities.get_token(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_ownership_counts() {
        let entities = Entities::new(Arc::new(InMemoryStore::new()));
        let token = sample_token();
        entities.add_token_to_user("0xowner", &token.id).await.unwrap();
        assert!(entities.user_owns("0xowner", &token.id).await.unwrap());

        entities.remove_token_from_user("0xowner", &token.id).await.unwrap();
        assert!(!entities.user_owns("0xowner", &token.id).await.unwrap());
    }

    #[tokio::test]
    async fn contract_supply_bump() {
        let entities = Entities::new(Arc::new(InMemoryStore::new()));
        let id = ContractId::new(8453, "0xabc").unwrap();
        let contract = ContractRecord {
            id: id.clone(),
            name: "OnchainRugs".to_string(),
            symbol: "RUG".to_string(),
            total_supply: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        entities.put_contract(&contract).await.unwrap();
        entities.bump_total_supply(&id, 25).await.unwrap();

        let loaded = entities.get_contract(&id).await.unwrap().unwrap();
        assert_eq!(loaded.total_supply, 25);
    }

    #[test]
    fn metadata_hash_is_stable() {
        let traits = vec![TraitId::from_raw("palette", "Arctic").unwrap()];
        let a = compute_metadata_hash("n", "d", "i", "a", &traits);
        let b = compute_metadata_hash("n", "d", "i", "a", &traits);
        assert_eq!(a, b);
        let c = compute_metadata_hash("n2", "d", "i", "a", &traits);
        assert_ne!(a, c);
    }
}
