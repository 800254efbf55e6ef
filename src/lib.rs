//! # rugcache
//!
//! Multi-tier caching and indexing engine for on-chain rug NFT metadata.
//! Read-heavy marketplace queries are served from a two-level cache instead of
//! round-tripping to the chain; writes flow through a pipelined orchestrator
//! that keeps the denormalized index structure consistent with the canonical
//! per-entity records. This crate provides:
//!
//! - **Normalized entity storage**: Token, Contract, Trait, and User records
//!   with relationship sets over an injected store boundary
//! - **Sorted-set indexes**: owners by token count and activity, tokens by
//!   dirt, aging, and maintenance recency, traits by popularity
//! - **Atomic operation orchestration**: transfer, batch mint, maintenance
//!   actions, and trait updates as verified, pipelined batches with
//!   compensating rollback
//! - **Multi-level caching**: process-local LRU over a shared persistent tier,
//!   with per-data-class TTLs and fetch-on-miss
//! - **Smart invalidation**: change-kind-aware dependency invalidation
//! - **Predictive warming**: behavior-driven cache pre-population with
//!   accuracy scoring
//! - **Monitoring**: latency and error tracking, health classification,
//!   structured alerts
//!
//! ## Consistency model
//!
//! The store offers single-command atomicity and pipelined batching, not
//! multi-key transactions. Cross-entity consistency is approximated: the
//! orchestrator verifies, pipelines, checks every per-command result, and
//! compensates on partial failure. The in-process cache tier is instance-local
//! and only a bounded-staleness optimization; invalidation is effective once
//! it reaches the shared tier.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rugcache::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     rugcache::logging::init_logging()?;
//!     let config = RugCacheConfig::default();
//!
//!     let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
//!     let cache = Arc::new(MultiLevelCache::new(store.clone(), config.cache.clone()));
//!     cache.start_sweeper();
//!
//!     let invalidation = Arc::new(SmartInvalidation::new(
//!         store.clone(),
//!         cache.clone(),
//!         &config.cache.ttl,
//!     ));
//!     let monitoring = Arc::new(Monitoring::new(
//!         store.clone(),
//!         cache.clone(),
//!         config.monitoring.clone(),
//!     ));
//!     let atomic = AtomicOperations::new(store.clone(), invalidation, monitoring);
//!
//!     let contract = ContractId::new(8453, "0x3d6670aC0A881Dcc742c17D687F5dfE05Af81cff")?;
//!     let result = atomic.batch_mint(&contract, vec![]).await;
//!     assert!(result.success);
//!     Ok(())
//! }
//! ```

pub mod errors;
pub mod logging;
pub mod config;
pub mod schema;
pub mod store;
pub mod bounded_log;
pub mod entities;
pub mod indexes;
pub mod registry;
pub mod cache;
pub mod invalidation;
pub mod warming;
pub mod monitoring;
pub mod atomic;

// Re-export commonly used types
pub use errors::{
    ConfigurationError, ErrorSeverity, NotFoundError, Result, RugCacheError, SerializationError,
    StoreError, StoreResult, ValidationError,
};

pub use config::{RugCacheConfig, TtlPair, TtlPolicy};
pub use schema::{keys, ContractId, TokenId, TraitCategory, TraitId, TraitValue};

/// Convenience imports for wiring the subsystem together.
pub mod prelude {
    pub use crate::atomic::{
        AtomicOperations, ConsistencyScope, MaintenanceData, MaintenanceKind, MintSpec,
        OperationResult,
    };
    pub use crate::cache::{CacheLookup, CacheSource, MultiLevelCache, SetOptions};
    pub use crate::config::{RugCacheConfig, TtlPair, TtlPolicy};
    pub use crate::entities::{DynamicState, Entities, TokenRecord};
    pub use crate::indexes::IndexManager;
    pub use crate::invalidation::{ChangeKind, InvalidationResult, SmartInvalidation};
    pub use crate::monitoring::{Monitoring, SystemHealth};
    pub use crate::registry::{TraitDefinition, TraitFilter, TraitRegistry};
    pub use crate::schema::{ContractId, TokenId, TraitId, TraitValue};
    pub use crate::store::{InMemoryStore, Store};
    pub use crate::warming::{BehaviorEvent, PredictiveWarmer};
}

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export key dependencies for convenience
pub use eyre;
pub use tokio;
pub use tracing;
