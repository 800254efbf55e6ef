//! Canonical identifiers and key layout for the rug cache
//!
//! Pure, deterministic builders and parsers for contract, token, and trait
//! identifiers, plus the single source of truth for every persisted key.
//! Parsing is the exact inverse of building; building with an empty component
//! fails validation.

use crate::errors::{ValidationError, ValidationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one NFT collection on one chain: `{chainId}:{contractAddress}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractId {
    chain_id: u64,
    address: String,
}

impl ContractId {
    pub fn new(chain_id: u64, address: impl Into<String>) -> ValidationResult<Self> {
        let address = address.into();
        if address.is_empty() {
            return Err(ValidationError::EmptyComponent {
                id_kind: "contract".to_string(),
                component: "address".to_string(),
            });
        }
        if address.contains(':') {
            return Err(ValidationError::MalformedId {
                id_kind: "contract".to_string(),
                value: address,
                reason: "address must not contain ':'".to_string(),
            });
        }
        Ok(Self { chain_id, address })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.address)
    }
}

impl FromStr for ContractId {
    type Err = ValidationError;

    fn from_str(s: &str) -> ValidationResult<Self> {
        let (chain, address) = s.split_once(':').ok_or_else(|| ValidationError::MalformedId {
            id_kind: "contract".to_string(),
            value: s.to_string(),
            reason: "expected {chainId}:{address}".to_string(),
        })?;
        let chain_id = chain.parse::<u64>().map_err(|_| ValidationError::MalformedId {
            id_kind: "contract".to_string(),
            value: s.to_string(),
            reason: "chain id is not a number".to_string(),
        })?;
        Self::new(chain_id, address)
    }
}

/// Globally unique token identifier: `{chainId}:{contractAddress}:{tokenNumber}`.
/// Immutable once minted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId {
    chain_id: u64,
    address: String,
    token_number: u64,
}

impl TokenId {
    pub fn new(chain_id: u64, address: impl Into<String>, token_number: u64) -> ValidationResult<Self> {
        let contract = ContractId::new(chain_id, address)?;
        Ok(Self {
            chain_id: contract.chain_id,
            address: contract.address,
            token_number,
        })
    }

    pub fn from_contract(contract: &ContractId, token_number: u64) -> Self {
        Self {
            chain_id: contract.chain_id,
            address: contract.address.clone(),
            token_number,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn token_number(&self) -> u64 {
        self.token_number
    }

    /// The collection this token belongs to.
    pub fn contract_id(&self) -> ContractId {
        ContractId {
            chain_id: self.chain_id,
            address: self.address.clone(),
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.address, self.token_number)
    }
}

impl FromStr for TokenId {
    type Err = ValidationError;

    fn from_str(s: &str) -> ValidationResult<Self> {
        let malformed = |reason: &str| ValidationError::MalformedId {
            id_kind: "token".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.splitn(3, ':');
        let chain = parts.next().ok_or_else(|| malformed("missing chain id"))?;
        let address = parts.next().ok_or_else(|| malformed("missing contract address"))?;
        let number = parts.next().ok_or_else(|| malformed("missing token number"))?;
        let chain_id = chain
            .parse::<u64>()
            .map_err(|_| malformed("chain id is not a number"))?;
        let token_number = number
            .parse::<u64>()
            .map_err(|_| malformed("token number is not a number"))?;
        Self::new(chain_id, address, token_number)
    }
}

/// Trait value categories persisted on trait records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraitCategory {
    Color,
    Numeric,
    Address,
    Text,
    Boolean,
}

impl fmt::Display for TraitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TraitCategory::Color => "color",
            TraitCategory::Numeric => "numeric",
            TraitCategory::Address => "address",
            TraitCategory::Text => "text",
            TraitCategory::Boolean => "boolean",
        };
        write!(f, "{s}")
    }
}

/// Tagged trait value with one canonical normalization per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TraitValue {
    Text(String),
    Numeric(i64),
    Address(String),
    Boolean(bool),
    Color(String),
}

impl TraitValue {
    pub fn category(&self) -> TraitCategory {
        match self {
            TraitValue::Text(_) => TraitCategory::Text,
            TraitValue::Numeric(_) => TraitCategory::Numeric,
            TraitValue::Address(_) => TraitCategory::Address,
            TraitValue::Boolean(_) => TraitCategory::Boolean,
            TraitValue::Color(_) => TraitCategory::Color,
        }
    }

    /// Raw display form, as shown to users.
    pub fn display(&self) -> String {
        match self {
            TraitValue::Text(s) | TraitValue::Color(s) => s.clone(),
            TraitValue::Address(a) => a.clone(),
            TraitValue::Numeric(n) => n.to_string(),
            TraitValue::Boolean(b) => b.to_string(),
        }
    }

    /// Canonical normalized form used in trait ids and set keys.
    pub fn canonical(&self) -> String {
        match self {
            TraitValue::Text(s) | TraitValue::Color(s) => normalize_value(s),
            TraitValue::Address(a) => a.trim().to_ascii_lowercase(),
            TraitValue::Numeric(n) => n.to_string(),
            TraitValue::Boolean(b) => b.to_string(),
        }
    }
}

/// Lowercase, map non-alphanumerics to `_`, collapse runs, trim leading and
/// trailing separators.
pub fn normalize_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_sep = true;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Normalized trait identifier: `trait_{type}_{normalizedValue}`.
///
/// Trait types may not contain `_` or `:` so that parsing an id back into its
/// type and value is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraitId {
    trait_type: String,
    normalized_value: String,
}

impl TraitId {
    pub fn new(trait_type: impl Into<String>, value: &TraitValue) -> ValidationResult<Self> {
        Self::from_normalized(trait_type, value.canonical())
    }

    pub fn from_raw(trait_type: impl Into<String>, raw_value: &str) -> ValidationResult<Self> {
        Self::from_normalized(trait_type, normalize_value(raw_value))
    }

    fn from_normalized(trait_type: impl Into<String>, normalized_value: String) -> ValidationResult<Self> {
        let trait_type = trait_type.into();
        if trait_type.is_empty() {
            return Err(ValidationError::EmptyComponent {
                id_kind: "trait".to_string(),
                component: "type".to_string(),
            });
        }
        if trait_type.contains('_') || trait_type.contains(':') {
            return Err(ValidationError::InvalidTraitType {
                value: trait_type,
                reason: "trait types may not contain '_' or ':'".to_string(),
            });
        }
        if normalized_value.is_empty() {
            return Err(ValidationError::EmptyComponent {
                id_kind: "trait".to_string(),
                component: "value".to_string(),
            });
        }
        Ok(Self {
            trait_type,
            normalized_value,
        })
    }

    /// The ownership pseudo-trait mirroring `user:{address}:tokens` for uniform
    /// trait-style querying.
    pub fn owner(address: &str) -> ValidationResult<Self> {
        Self::from_normalized("owner", address.trim().to_ascii_lowercase())
    }

    pub fn trait_type(&self) -> &str {
        &self.trait_type
    }

    pub fn normalized_value(&self) -> &str {
        &self.normalized_value
    }
}

impl fmt::Display for TraitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trait_{}_{}", self.trait_type, self.normalized_value)
    }
}

impl FromStr for TraitId {
    type Err = ValidationError;

    fn from_str(s: &str) -> ValidationResult<Self> {
        let malformed = |reason: &str| ValidationError::MalformedId {
            id_kind: "trait".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let rest = s.strip_prefix("trait_").ok_or_else(|| malformed("missing trait_ prefix"))?;
        let (trait_type, normalized) = rest
            .split_once('_')
            .ok_or_else(|| malformed("expected trait_{type}_{value}"))?;
        Self::from_normalized(trait_type.to_string(), normalized.to_string())
    }
}

/// Persisted key layout. Store-agnostic; every module goes through these
/// builders so the layout lives in exactly one place.
pub mod keys {
    use super::{ContractId, TokenId, TraitId};

    // Entity records (hashes)
    pub fn token(id: &TokenId) -> String {
        format!("token:{id}")
    }

    pub fn contract(id: &ContractId) -> String {
        format!("contract:{id}")
    }

    pub fn trait_record(id: &TraitId) -> String {
        format!("trait:{id}")
    }

    pub fn user(address: &str) -> String {
        format!("user:{address}")
    }

    // Relationship sets
    pub fn contract_tokens(id: &ContractId) -> String {
        format!("contract:{id}:tokens")
    }

    pub fn user_tokens(address: &str) -> String {
        format!("user:{address}:tokens")
    }

    pub fn trait_tokens(id: &TraitId) -> String {
        format!("trait:{id}:tokens")
    }

    // Sorted-set indexes
    pub fn owners_by_token_count(contract: &ContractId) -> String {
        format!("index:owners:by_token_count:{contract}")
    }

    pub fn owners_by_activity(contract: &ContractId) -> String {
        format!("index:owners:by_activity:{contract}")
    }

    pub fn tokens_by_dirt_level(contract: &ContractId) -> String {
        format!("index:tokens:by_dirt_level:{contract}")
    }

    pub fn tokens_by_aging_level(contract: &ContractId) -> String {
        format!("index:tokens:by_aging_level:{contract}")
    }

    pub fn tokens_by_maintenance(contract: &ContractId) -> String {
        format!("index:tokens:by_maintenance:{contract}")
    }

    pub fn traits_by_popularity(contract: &ContractId) -> String {
        format!("index:traits:by_popularity:{contract}")
    }

    pub fn owner_trait_composite(contract: &ContractId, owner: &str) -> String {
        format!("index:composite:owner_trait:{contract}:{owner}")
    }

    // Multi-level cache entries (L2 tier)
    pub fn cache_multilevel(logical_key: &str) -> String {
        format!("cache:multilevel:{logical_key}")
    }

    pub fn cache_token(id: &TokenId) -> String {
        format!("token:{id}")
    }

    pub fn cache_static_metadata(id: &TokenId) -> String {
        format!("metadata:static:{id}")
    }

    pub fn cache_dynamic(id: &TokenId) -> String {
        format!("metadata:dynamic:{id}")
    }

    pub fn cache_collection_page(contract: &ContractId, page: u64) -> String {
        format!("collection:{contract}:page:{page}")
    }

    pub fn cache_contract_traits(contract: &ContractId) -> String {
        format!("traits:{contract}")
    }

    pub fn cache_owner_portfolio(address: &str) -> String {
        format!("owner:{address}")
    }

    // Analytics
    pub fn trait_usage(scope: &str) -> String {
        format!("analytics:trait_usage:{scope}")
    }

    pub fn ownership_analytics(contract: &ContractId) -> String {
        format!("analytics:ownership:{contract}")
    }

    pub fn maintenance_analytics(contract: &ContractId) -> String {
        format!("analytics:maintenance:{contract}")
    }

    pub fn user_behavior(address: &str) -> String {
        format!("analytics:user_behavior:{address}")
    }

    pub fn predictions(address: &str) -> String {
        format!("analytics:predictions:{address}")
    }

    pub fn trending_tokens() -> String {
        "analytics:trending:tokens".to_string()
    }

    // Invalidation markers
    pub fn recent_maintenance(id: &TokenId) -> String {
        format!("recent:maintenance:{id}")
    }

    pub fn contract_dirty(contract: &ContractId) -> String {
        format!("cleanup:contract:{contract}")
    }

    // Metrics
    pub fn performance_log(operation: &str) -> String {
        format!("metrics:performance:{operation}")
    }

    pub fn error_log() -> String {
        "metrics:errors".to_string()
    }

    pub fn slow_operations() -> String {
        "metrics:slow_operations".to_string()
    }

    pub fn error_rates(date: &str) -> String {
        format!("metrics:error_rates:{date}")
    }

    pub fn operation_counts(date: &str) -> String {
        format!("metrics:operation_counts:{date}")
    }

    pub fn cache_performance() -> String {
        "metrics:cache_performance".to_string()
    }

    pub fn tracked_operations() -> String {
        "metrics:operations".to_string()
    }

    // Audit
    pub fn audit_operations(date: &str) -> String {
        format!("audit:operations:{date}")
    }
}
