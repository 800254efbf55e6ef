//! Atomic operation orchestration
//!
//! Composes entity writes and index updates into multi-step business
//! operations: transfer, batch mint, maintenance actions, trait updates, and a
//! consistency check. Each operation follows the same shape:
//!
//! 1. verification reads
//! 2. one pipelined write batch
//! 3. per-command failure collection, with best-effort compensating rollback
//! 4. cache invalidation and monitoring
//!
//! The store offers no multi-key transactions, so the verify-then-pipeline
//! pattern has a window: two concurrent mutations of the same token can
//! interleave between the verification read and the pipelined write. That race
//! is an accepted part of this design; the consistency checker is the
//! detective control for it, and rollback here is compensation, not undo.
//!
//! No method lets an error escape its boundary: every path returns an
//! [`OperationResult`] and callers branch on `success`.

use crate::bounded_log::BoundedLog;
use crate::entities::{compute_metadata_hash, DynamicState, Entities, TokenRecord};
use crate::errors::{NotFoundError, RugCacheError};
use crate::indexes::IndexManager;
use crate::invalidation::{ChangeKind, SmartInvalidation};
use crate::monitoring::Monitoring;
use crate::schema::{keys, ContractId, TokenId, TraitId};
use crate::store::{pipeline_failures, Command, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const AUDIT_LOG_CAPACITY: usize = 1_000;

/// Result of one orchestrated operation. `partial_failures` lists the
/// pipelined commands that failed when `error` reports a partial failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub operation_id: String,
    pub duration_ms: u64,
    pub affected_entities: Vec<String>,
    pub error: Option<String>,
    pub partial_failures: Vec<String>,
}

impl OperationResult {
    fn started(operation_id: String, affected_entities: Vec<String>) -> Self {
        Self {
            success: false,
            operation_id,
            duration_ms: 0,
            affected_entities,
            error: None,
            partial_failures: Vec::new(),
        }
    }
}

/// One token in a batch mint.
#[derive(Debug, Clone)]
pub struct MintSpec {
    pub token_number: u64,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub image: String,
    pub animation_url: String,
    pub traits: Vec<TraitId>,
}

/// Maintenance action kinds and their effect on dynamic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    /// Bump the maintenance counter and timestamp.
    Maintenance,
    /// Reset dirt to zero, bump the cleaning counter.
    Cleaning,
    /// Bump the restoration counter; with a level, recompute aging.
    Restoration,
}

impl std::fmt::Display for MaintenanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceKind::Maintenance => write!(f, "maintenance"),
            MaintenanceKind::Cleaning => write!(f, "cleaning"),
            MaintenanceKind::Restoration => write!(f, "restoration"),
        }
    }
}

/// Extra inputs for maintenance actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceData {
    /// Restoration strength; aging becomes `max(0, 100 - level)`.
    pub level: Option<u32>,
}

/// What a consistency check should cover.
#[derive(Debug, Clone)]
pub enum ConsistencyScope {
    Token(TokenId),
    /// A random sample drawn from the contract's token set.
    Sample { contract: ContractId, size: usize },
}

/// Outcome of a consistency check. Detective, not corrective: discrepancies
/// are reported, never repaired here.
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub issues: Vec<String>,
}

pub struct AtomicOperations {
    store: Arc<dyn Store>,
    entities: Entities,
    invalidation: Arc<SmartInvalidation>,
    monitoring: Arc<Monitoring>,
    operation_counter: AtomicU64,
}

impl AtomicOperations {
    pub fn new(
        store: Arc<dyn Store>,
        invalidation: Arc<SmartInvalidation>,
        monitoring: Arc<Monitoring>,
    ) -> Self {
        let entities = Entities::new(store.clone());
        Self {
            store,
            entities,
            invalidation,
            monitoring,
            operation_counter: AtomicU64::new(0),
        }
    }

    fn next_operation_id(&self, kind: &str) -> String {
        let n = self.operation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{kind}_{n}_{}", Utc::now().timestamp_millis())
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Transfer a token between owners.
    ///
    /// Verifies current ownership, then pipelines the owner field update, both
    /// user-set moves, the token-count index deltas, the owner pseudo-trait
    /// swap, and the activity bump. On partial failure the rollback restores
    /// only the owner field and the user sets; index and trait compensation is
    /// not attempted.
    pub async fn transfer(&self, token_id: &TokenId, from: &str, to: &str) -> OperationResult {
        let operation_id = self.next_operation_id("transfer");
        let started = Instant::now();
        let result = OperationResult::started(
            operation_id,
            vec![token_id.to_string(), from.to_string(), to.to_string()],
        );

        let token = match self.entities.get_token(token_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return self
                    .finish(
                        "transfer",
                        result,
                        started,
                        Some(NotFoundError::Token(token_id.to_string()).into()),
                    )
                    .await;
            }
            Err(e) => return self.finish("transfer", result, started, Some(e)).await,
        };

        if token.owner != from {
            let err = RugCacheError::OwnershipMismatch {
                token: token_id.to_string(),
                claimed: from.to_string(),
                actual: token.owner.clone(),
            };
            return self.finish("transfer", result, started, Some(err)).await;
        }

        let (from_trait, to_trait) = match (TraitId::owner(from), TraitId::owner(to)) {
            (Ok(f), Ok(t)) => (f, t),
            (Err(e), _) | (_, Err(e)) => {
                return self.finish("transfer", result, started, Some(e.into())).await;
            }
        };

        let contract = token_id.contract_id();
        let now = Utc::now();
        let raw_token = token_id.to_string();
        let commands = vec![
            Command::HSet {
                key: keys::token(token_id),
                fields: vec![
                    ("owner".to_string(), to.to_string()),
                    ("last_transfer".to_string(), now.to_rfc3339()),
                ],
            },
            Command::SRem {
                key: keys::user_tokens(from),
                member: raw_token.clone(),
            },
            Command::SAdd {
                key: keys::user_tokens(to),
                member: raw_token.clone(),
            },
            IndexManager::bump_owner_count_cmd(&contract, from, -1),
            IndexManager::bump_owner_count_cmd(&contract, to, 1),
            Command::SRem {
                key: keys::trait_tokens(&from_trait),
                member: raw_token.clone(),
            },
            Command::SAdd {
                key: keys::trait_tokens(&to_trait),
                member: raw_token,
            },
            IndexManager::touch_activity_cmd(&contract, to, now.timestamp_millis()),
        ];

        let total = commands.len();
        let outcomes = match self.store.pipeline(commands.clone()).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                // Nothing executed; no compensation needed.
                return self.finish("transfer", result, started, Some(e.into())).await;
            }
        };

        let failures = pipeline_failures(&commands, &outcomes);
        if !failures.is_empty() {
            self.rollback_transfer(&result.operation_id, token_id, from, to).await;
            let err = RugCacheError::TransactionPartialFailure {
                operation_id: result.operation_id.clone(),
                failed: failures.len(),
                total,
            };
            let mut result = result;
            result.partial_failures = failures;
            return self.finish("transfer", result, started, Some(err)).await;
        }

        self.invalidation.invalidate_transfer(token_id, from, to).await;
        self.finish("transfer", result, started, None).await
    }

    /// Compensate a failed transfer: restore the owner field and the two user
    /// sets. Index deltas and the pseudo-trait swap stay as they landed; the
    /// consistency checker surfaces what this leaves behind.
    async fn rollback_transfer(&self, operation_id: &str, token_id: &TokenId, from: &str, to: &str) {
        info!(operation_id, token = %token_id, "rolling back transfer");
        let raw_token = token_id.to_string();
        let commands = vec![
            Command::HSet {
                key: keys::token(token_id),
                fields: vec![("owner".to_string(), from.to_string())],
            },
            Command::SRem {
                key: keys::user_tokens(to),
                member: raw_token.clone(),
            },
            Command::SAdd {
                key: keys::user_tokens(from),
                member: raw_token,
            },
        ];
        match self.store.pipeline(commands.clone()).await {
            Ok(outcomes) => {
                let failures = pipeline_failures(&commands, &outcomes);
                if failures.is_empty() {
                    info!(operation_id, "transfer rollback completed");
                } else {
                    error!(operation_id, ?failures, "transfer rollback incomplete");
                }
            }
            Err(e) => error!(operation_id, error = %e, "transfer rollback failed"),
        }
    }

    // =========================================================================
    // Batch mint
    // =========================================================================

    /// Mint a batch of tokens in one pipeline: full records, contract / user /
    /// trait memberships, and index updates. On partial failure the batch is
    /// reported failed without per-token rollback: compensation across a
    /// partially-applied mint batch is not implemented, and the consistency
    /// checker is the backstop.
    pub async fn batch_mint(&self, contract: &ContractId, tokens: Vec<MintSpec>) -> OperationResult {
        let operation_id = self.next_operation_id("batch_mint");
        let started = Instant::now();
        let minted = tokens.len() as i64;

        let mut affected = Vec::with_capacity(tokens.len());
        let mut commands = Vec::new();
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        for spec in &tokens {
            let token_id = TokenId::from_contract(contract, spec.token_number);
            affected.push(token_id.to_string());
            let raw_token = token_id.to_string();

            let record = TokenRecord {
                id: token_id.clone(),
                owner: spec.owner.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                image: spec.image.clone(),
                animation_url: spec.animation_url.clone(),
                traits: spec.traits.clone(),
                dynamic: DynamicState::default(),
                metadata_hash: compute_metadata_hash(
                    &spec.name,
                    &spec.description,
                    &spec.image,
                    &spec.animation_url,
                    &spec.traits,
                ),
                last_refresh: now,
                created_at: now,
            };
            let fields = match Entities::token_fields(&record) {
                Ok(fields) => fields,
                Err(e) => {
                    let result = OperationResult::started(operation_id, affected);
                    return self.finish("batch_mint", result, started, Some(e)).await;
                }
            };

            commands.push(Command::HSet {
                key: keys::token(&token_id),
                fields,
            });
            commands.push(Command::SAdd {
                key: keys::contract_tokens(contract),
                member: raw_token.clone(),
            });
            commands.push(Command::SAdd {
                key: keys::user_tokens(&spec.owner),
                member: raw_token.clone(),
            });
            commands.push(Command::HIncrBy {
                key: keys::user(&spec.owner),
                field: "nft_count".to_string(),
                delta: 1,
            });

            if let Ok(owner_trait) = TraitId::owner(&spec.owner) {
                commands.push(Command::SAdd {
                    key: keys::trait_tokens(&owner_trait),
                    member: raw_token.clone(),
                });
            }
            for trait_id in &spec.traits {
                commands.push(Command::SAdd {
                    key: keys::trait_tokens(trait_id),
                    member: raw_token.clone(),
                });
                commands.push(Command::HIncrBy {
                    key: keys::trait_record(trait_id),
                    field: "token_count".to_string(),
                    delta: 1,
                });
                commands.push(IndexManager::bump_popularity_cmd(contract, trait_id, 1));
                commands.push(IndexManager::record_owner_trait_cmd(
                    contract,
                    &spec.owner,
                    trait_id,
                    now_ms,
                ));
            }

            commands.push(IndexManager::bump_owner_count_cmd(contract, &spec.owner, 1));
            commands.push(IndexManager::touch_activity_cmd(contract, &spec.owner, now_ms));
            commands.push(IndexManager::set_dirt_cmd(contract, &token_id, 0));
            commands.push(IndexManager::set_aging_cmd(contract, &token_id, 0));
        }

        let result = OperationResult::started(operation_id, affected);
        let total = commands.len();
        let outcomes = match self.store.pipeline(commands.clone()).await {
            Ok(outcomes) => outcomes,
            Err(e) => return self.finish("batch_mint", result, started, Some(e.into())).await,
        };

        let failures = pipeline_failures(&commands, &outcomes);
        if !failures.is_empty() {
            let err = RugCacheError::TransactionPartialFailure {
                operation_id: result.operation_id.clone(),
                failed: failures.len(),
                total,
            };
            let mut result = result;
            result.partial_failures = failures;
            return self.finish("batch_mint", result, started, Some(err)).await;
        }

        if let Err(e) = self.entities.bump_total_supply(contract, minted).await {
            warn!(contract = %contract, error = %e, "total supply update failed after mint");
        }
        self.finish("batch_mint", result, started, None).await
    }

    // =========================================================================
    // Maintenance actions
    // =========================================================================

    /// Apply a maintenance action to a token's dynamic state and the
    /// dirt/aging/maintenance indexes.
    pub async fn maintenance(
        &self,
        token_id: &TokenId,
        user: &str,
        kind: MaintenanceKind,
        data: Option<MaintenanceData>,
    ) -> OperationResult {
        let operation_id = self.next_operation_id(&format!("maintenance_{kind}"));
        let started = Instant::now();
        let result = OperationResult::started(
            operation_id,
            vec![token_id.to_string(), user.to_string()],
        );

        let token = match self.entities.get_token(token_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return self
                    .finish(
                        "maintenance",
                        result,
                        started,
                        Some(NotFoundError::Token(token_id.to_string()).into()),
                    )
                    .await;
            }
            Err(e) => return self.finish("maintenance", result, started, Some(e)).await,
        };

        if token.owner != user {
            let err = RugCacheError::OwnershipMismatch {
                token: token_id.to_string(),
                claimed: user.to_string(),
                actual: token.owner.clone(),
            };
            return self.finish("maintenance", result, started, Some(err)).await;
        }

        let now = Utc::now();
        let mut dynamic = token.dynamic.clone();
        match kind {
            MaintenanceKind::Maintenance => {
                dynamic.maintenance_count += 1;
                dynamic.last_maintenance = Some(now);
            }
            MaintenanceKind::Cleaning => {
                dynamic.cleaning_count += 1;
                dynamic.last_cleaning = Some(now);
                dynamic.dirt_level = 0;
            }
            MaintenanceKind::Restoration => {
                dynamic.restoration_count += 1;
                dynamic.last_maintenance = Some(now);
                if let Some(level) = data.and_then(|d| d.level) {
                    dynamic.aging_level = 100u32.saturating_sub(level);
                }
            }
        }

        let dynamic_json = match serde_json::to_string(&dynamic) {
            Ok(raw) => raw,
            Err(e) => {
                let err = crate::errors::SerializationError::Encode {
                    context: "token.dynamic".to_string(),
                    reason: e.to_string(),
                };
                return self.finish("maintenance", result, started, Some(err.into())).await;
            }
        };

        let contract = token_id.contract_id();
        let mut commands = vec![
            Command::HSet {
                key: keys::token(token_id),
                fields: vec![
                    ("dynamic".to_string(), dynamic_json),
                    ("last_refresh".to_string(), now.to_rfc3339()),
                ],
            },
            IndexManager::touch_maintenance_cmd(&contract, token_id, now.timestamp_millis()),
        ];
        if kind == MaintenanceKind::Cleaning {
            commands.push(IndexManager::set_dirt_cmd(&contract, token_id, 0));
        }
        if kind == MaintenanceKind::Restoration && data.and_then(|d| d.level).is_some() {
            commands.push(IndexManager::set_aging_cmd(&contract, token_id, dynamic.aging_level));
        }

        let total = commands.len();
        let outcomes = match self.store.pipeline(commands.clone()).await {
            Ok(outcomes) => outcomes,
            Err(e) => return self.finish("maintenance", result, started, Some(e.into())).await,
        };

        let failures = pipeline_failures(&commands, &outcomes);
        if !failures.is_empty() {
            let err = RugCacheError::TransactionPartialFailure {
                operation_id: result.operation_id.clone(),
                failed: failures.len(),
                total,
            };
            let mut result = result;
            result.partial_failures = failures;
            return self.finish("maintenance", result, started, Some(err)).await;
        }

        self.invalidation.invalidate(token_id, ChangeKind::Maintenance).await;
        self.finish("maintenance", result, started, None).await
    }

    // =========================================================================
    // Trait updates
    // =========================================================================

    /// Replace a token's trait list. Only the symmetric difference is written:
    /// traits leaving the token lose membership and counts, traits joining it
    /// gain them. Rollback re-applies the update with the lists swapped.
    pub async fn trait_update(
        &self,
        token_id: &TokenId,
        old_traits: &[TraitId],
        new_traits: &[TraitId],
    ) -> OperationResult {
        let operation_id = self.next_operation_id("trait_update");
        let started = Instant::now();
        let result = OperationResult::started(operation_id, vec![token_id.to_string()]);

        let commands = match self.trait_update_commands(token_id, old_traits, new_traits) {
            Ok(commands) => commands,
            Err(e) => return self.finish("trait_update", result, started, Some(e)).await,
        };

        let total = commands.len();
        let outcomes = match self.store.pipeline(commands.clone()).await {
            Ok(outcomes) => outcomes,
            Err(e) => return self.finish("trait_update", result, started, Some(e.into())).await,
        };

        let failures = pipeline_failures(&commands, &outcomes);
        if !failures.is_empty() {
            self.rollback_trait_update(&result.operation_id, token_id, old_traits, new_traits)
                .await;
            let err = RugCacheError::TransactionPartialFailure {
                operation_id: result.operation_id.clone(),
                failed: failures.len(),
                total,
            };
            let mut result = result;
            result.partial_failures = failures;
            return self.finish("trait_update", result, started, Some(err)).await;
        }

        self.invalidation.invalidate(token_id, ChangeKind::Metadata).await;
        self.finish("trait_update", result, started, None).await
    }

    fn trait_update_commands(
        &self,
        token_id: &TokenId,
        old_traits: &[TraitId],
        new_traits: &[TraitId],
    ) -> crate::errors::Result<Vec<Command>> {
        let contract = token_id.contract_id();
        let raw_token = token_id.to_string();
        let old_set: HashSet<&TraitId> = old_traits.iter().collect();
        let new_set: HashSet<&TraitId> = new_traits.iter().collect();

        let mut commands = Vec::new();
        for removed in old_set.difference(&new_set) {
            commands.push(Command::SRem {
                key: keys::trait_tokens(removed),
                member: raw_token.clone(),
            });
            commands.push(Command::HIncrBy {
                key: keys::trait_record(removed),
                field: "token_count".to_string(),
                delta: -1,
            });
            commands.push(IndexManager::bump_popularity_cmd(&contract, removed, -1));
        }
        for added in new_set.difference(&old_set) {
            commands.push(Command::SAdd {
                key: keys::trait_tokens(added),
                member: raw_token.clone(),
            });
            commands.push(Command::HIncrBy {
                key: keys::trait_record(added),
                field: "token_count".to_string(),
                delta: 1,
            });
            commands.push(IndexManager::bump_popularity_cmd(&contract, added, 1));
        }

        let trait_list: Vec<String> = new_traits.iter().map(|t| t.to_string()).collect();
        let traits_json =
            serde_json::to_string(&trait_list).map_err(|e| crate::errors::SerializationError::Encode {
                context: "token.traits".to_string(),
                reason: e.to_string(),
            })?;
        commands.push(Command::HSet {
            key: keys::token(token_id),
            fields: vec![
                ("traits".to_string(), traits_json),
                ("last_refresh".to_string(), Utc::now().to_rfc3339()),
            ],
        });
        Ok(commands)
    }

    async fn rollback_trait_update(
        &self,
        operation_id: &str,
        token_id: &TokenId,
        old_traits: &[TraitId],
        new_traits: &[TraitId],
    ) {
        info!(operation_id, token = %token_id, "rolling back trait update");
        // Re-apply with the lists swapped; best effort.
        match self.trait_update_commands(token_id, new_traits, old_traits) {
            Ok(commands) => match self.store.pipeline(commands.clone()).await {
                Ok(outcomes) => {
                    let failures = pipeline_failures(&commands, &outcomes);
                    if failures.is_empty() {
                        info!(operation_id, "trait update rollback completed");
                    } else {
                        error!(operation_id, ?failures, "trait update rollback incomplete");
                    }
                }
                Err(e) => error!(operation_id, error = %e, "trait update rollback failed"),
            },
            Err(e) => error!(operation_id, error = %e, "trait update rollback could not build"),
        }
    }

    // =========================================================================
    // Consistency check
    // =========================================================================

    /// Verify relationship invariants for one token or a random sample of a
    /// contract. Never fails: store errors become reported issues.
    pub async fn verify_consistency(&self, scope: ConsistencyScope) -> ConsistencyReport {
        let issues = match scope {
            ConsistencyScope::Token(token_id) => self.check_token_consistency(&token_id).await,
            ConsistencyScope::Sample { contract, size } => {
                match self
                    .store
                    .srandmember(&keys::contract_tokens(&contract), size)
                    .await
                {
                    Ok(sample) => {
                        let mut issues = Vec::new();
                        for raw_id in sample {
                            match TokenId::from_str(&raw_id) {
                                Ok(token_id) => {
                                    issues.extend(self.check_token_consistency(&token_id).await)
                                }
                                Err(_) => issues.push(format!(
                                    "contract {contract} token set contains malformed id {raw_id}"
                                )),
                            }
                        }
                        issues
                    }
                    Err(e) => vec![format!("consistency check failed: {e}")],
                }
            }
        };

        ConsistencyReport {
            consistent: issues.is_empty(),
            issues,
        }
    }

    async fn check_token_consistency(&self, token_id: &TokenId) -> Vec<String> {
        let mut issues = Vec::new();
        let raw_token = token_id.to_string();

        let token = match self.entities.get_token(token_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return vec![format!("token {token_id} not found")],
            Err(e) => return vec![format!("consistency check error for {token_id}: {e}")],
        };

        match self.entities.user_owns(&token.owner, token_id).await {
            Ok(true) => {}
            Ok(false) => issues.push(format!(
                "token {token_id} not in owner's ({}) token set",
                token.owner
            )),
            Err(e) => issues.push(format!("owner set check failed for {token_id}: {e}")),
        }

        let contract = token_id.contract_id();
        match self
            .store
            .sismember(&keys::contract_tokens(&contract), &raw_token)
            .await
        {
            Ok(true) => {}
            Ok(false) => issues.push(format!(
                "token {token_id} not in contract ({contract}) token set"
            )),
            Err(e) => issues.push(format!("contract set check failed for {token_id}: {e}")),
        }

        for trait_id in &token.traits {
            match self
                .store
                .sismember(&keys::trait_tokens(trait_id), &raw_token)
                .await
            {
                Ok(true) => {}
                Ok(false) => issues.push(format!(
                    "token {token_id} not in trait ({trait_id}) token set"
                )),
                Err(e) => issues.push(format!("trait set check failed for {token_id}: {e}")),
            }
        }

        issues
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Recent operation results for a day (today when unspecified).
    pub async fn operation_history(
        &self,
        date: Option<&str>,
        limit: usize,
    ) -> Vec<OperationResult> {
        let date = date
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
        let log = BoundedLog::new(
            self.store.clone(),
            keys::audit_operations(&date),
            AUDIT_LOG_CAPACITY,
        );
        log.recent(limit)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry.member).ok())
            .collect()
    }

    async fn log_audit(&self, result: &OperationResult) {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let log = BoundedLog::new(
            self.store.clone(),
            keys::audit_operations(&date),
            AUDIT_LOG_CAPACITY,
        );
        match serde_json::to_string(result) {
            Ok(member) => {
                if let Err(e) = log.append(Utc::now().timestamp_millis() as f64, &member).await {
                    debug!(error = %e, "audit log write failed");
                }
            }
            Err(e) => debug!(error = %e, "audit entry failed to serialize"),
        }
    }

    /// Seal a result: set duration and success, track, audit.
    async fn finish(
        &self,
        kind: &str,
        mut result: OperationResult,
        started: Instant,
        error: Option<RugCacheError>,
    ) -> OperationResult {
        result.duration_ms = started.elapsed().as_millis() as u64;
        match error {
            Some(e) => {
                result.success = false;
                result.error = Some(e.to_string());
                warn!(
                    operation_id = %result.operation_id,
                    kind,
                    error = %e,
                    "operation failed"
                );
            }
            None => {
                result.success = true;
                debug!(
                    operation_id = %result.operation_id,
                    kind,
                    duration_ms = result.duration_ms,
                    "operation completed"
                );
            }
        }

        self.monitoring
            .track_performance(
                kind,
                result.duration_ms,
                result.success,
                json!({
                    "operation_id": result.operation_id,
                    "error": result.error,
                    "affected": result.affected_entities.len(),
                }),
            )
            .await;
        self.log_audit(&result).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MultiLevelCache;
    use crate::config::{CacheConfig, MonitoringConfig};
    use crate::store::InMemoryStore;

    fn setup() -> (AtomicOperations, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let cache_config = CacheConfig::default();
        let policy = cache_config.ttl.clone();
        let cache = Arc::new(MultiLevelCache::new(store.clone(), cache_config));
        let invalidation = Arc::new(SmartInvalidation::new(store.clone(), cache.clone(), &policy));
        let monitoring = Arc::new(Monitoring::new(
            store.clone(),
            cache,
            MonitoringConfig::default(),
        ));
        (
            AtomicOperations::new(store.clone(), invalidation, monitoring),
            store,
        )
    }

    fn contract() -> ContractId {
        ContractId::new(8453, "0xrug").unwrap()
    }

    fn mint_spec(number: u64, owner: &str, traits: Vec<TraitId>) -> MintSpec {
        MintSpec {
            token_number: number,
            owner: owner.to_string(),
            name: format!("Rug #{number}"),
            description: "woven onchain".to_string(),
            image: format!("ipfs://rug/{number}"),
            animation_url: String::new(),
            traits,
        }
    }

    #[tokio::test]
    async fn batch_mint_writes_records_and_memberships() {
        let (atomic, store) = setup();
        let c = contract();
        let palette = TraitId::from_raw("palette", "Arctic").unwrap();

        let result = atomic
            .batch_mint(&c, vec![mint_spec(1, "0xa", vec![palette.clone()])])
            .await;
        assert!(result.success, "mint failed: {:?}", result.error);
        assert!(result.operation_id.starts_with("batch_mint_"));

        let token = TokenId::new(8453, "0xrug", 1).unwrap();
        assert!(store
            .sismember(&keys::contract_tokens(&c), &token.to_string())
            .await
            .unwrap());
        assert!(store
            .sismember(&keys::user_tokens("0xa"), &token.to_string())
            .await
            .unwrap());
        assert!(store
            .sismember(&keys::trait_tokens(&palette), &token.to_string())
            .await
            .unwrap());

        let supply = store
            .hget(&keys::contract(&c), "total_supply")
            .await
            .unwrap();
        assert_eq!(supply.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn transfer_moves_ownership() {
        let (atomic, store) = setup();
        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(42, "0xa", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 42).unwrap();

        let result = atomic.transfer(&token, "0xa", "0xb").await;
        assert!(result.success, "transfer failed: {:?}", result.error);

        assert!(!store
            .sismember(&keys::user_tokens("0xa"), &token.to_string())
            .await
            .unwrap());
        assert!(store
            .sismember(&keys::user_tokens("0xb"), &token.to_string())
            .await
            .unwrap());
        assert_eq!(
            store.hget(&keys::token(&token), "owner").await.unwrap().as_deref(),
            Some("0xb")
        );
    }

    #[tokio::test]
    async fn transfer_from_wrong_owner_changes_nothing() {
        let (atomic, store) = setup();
        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(42, "0xc", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 42).unwrap();

        let result = atomic.transfer(&token, "0xa", "0xb").await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("ownership mismatch"));

        assert!(store
            .sismember(&keys::user_tokens("0xc"), &token.to_string())
            .await
            .unwrap());
        assert!(!store
            .sismember(&keys::user_tokens("0xb"), &token.to_string())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cleaning_resets_dirt_and_updates_index() {
        let (atomic, store) = setup();
        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(7, "0xa", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 7).unwrap();

        // Dirty the token first.
        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        let mut record = entities.get_token(&token).await.unwrap().unwrap();
        record.dynamic.dirt_level = 55;
        entities.put_token(&record).await.unwrap();

        let result = atomic
            .maintenance(&token, "0xa", MaintenanceKind::Cleaning, None)
            .await;
        assert!(result.success);

        let updated = entities.get_token(&token).await.unwrap().unwrap();
        assert_eq!(updated.dynamic.dirt_level, 0);
        assert_eq!(updated.dynamic.cleaning_count, 1);

        let score = store
            .zscore(&keys::tokens_by_dirt_level(&c), &token.to_string())
            .await
            .unwrap();
        assert_eq!(score, Some(0.0));
    }

    #[tokio::test]
    async fn restoration_recomputes_aging() {
        let (atomic, store) = setup();
        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(8, "0xa", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 8).unwrap();

        let result = atomic
            .maintenance(
                &token,
                "0xa",
                MaintenanceKind::Restoration,
                Some(MaintenanceData { level: Some(30) }),
            )
            .await;
        assert!(result.success);

        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        let updated = entities.get_token(&token).await.unwrap().unwrap();
        assert_eq!(updated.dynamic.aging_level, 70);
        assert_eq!(updated.dynamic.restoration_count, 1);
    }

    #[tokio::test]
    async fn trait_update_applies_symmetric_difference() {
        let (atomic, store) = setup();
        let c = contract();
        let arctic = TraitId::from_raw("palette", "Arctic").unwrap();
        let gold = TraitId::from_raw("frame", "Gold").unwrap();
        atomic
            .batch_mint(&c, vec![mint_spec(9, "0xa", vec![arctic.clone()])])
            .await;
        let token = TokenId::new(8453, "0xrug", 9).unwrap();

        let result = atomic
            .trait_update(&token, &[arctic.clone()], &[gold.clone()])
            .await;
        assert!(result.success);

        assert!(!store
            .sismember(&keys::trait_tokens(&arctic), &token.to_string())
            .await
            .unwrap());
        assert!(store
            .sismember(&keys::trait_tokens(&gold), &token.to_string())
            .await
            .unwrap());

        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        let updated = entities.get_token(&token).await.unwrap().unwrap();
        assert_eq!(updated.traits, vec![gold]);
    }

    #[tokio::test]
    async fn consistency_check_passes_after_mint_and_transfer() {
        let (atomic, _) = setup();
        let c = contract();
        let palette = TraitId::from_raw("palette", "Arctic").unwrap();
        atomic
            .batch_mint(&c, vec![mint_spec(1, "0xa", vec![palette])])
            .await;
        let token = TokenId::new(8453, "0xrug", 1).unwrap();
        atomic.transfer(&token, "0xa", "0xb").await;

        let report = atomic
            .verify_consistency(ConsistencyScope::Token(token))
            .await;
        assert!(report.consistent, "issues: {:?}", report.issues);
    }

    #[tokio::test]
    async fn consistency_check_reports_missing_membership() {
        let (atomic, store) = setup();
        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(2, "0xa", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 2).unwrap();

        // Break the owner-set invariant behind the orchestrator's back.
        store
            .srem(&keys::user_tokens("0xa"), &token.to_string())
            .await
            .unwrap();

        let report = atomic
            .verify_consistency(ConsistencyScope::Token(token))
            .await;
        assert!(!report.consistent);
        assert!(report.issues[0].contains("owner's"));
    }

    #[tokio::test]
    async fn audit_log_records_operations() {
        let (atomic, _) = setup();
        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(3, "0xa", vec![])]).await;

        let history = atomic.operation_history(None, 10).await;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert!(history[0].operation_id.starts_with("batch_mint_"));
    }
}
