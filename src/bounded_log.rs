//! Bounded, score-ordered log over a store sorted set
//!
//! Behavior logs, metrics samples, and audit trails all need the same shape:
//! append scored entries and keep only the newest N. Instead of repeating the
//! zadd-then-trim pair inline at every call site, [`BoundedLog`] enforces
//! trim-on-write in one place. Entries beyond the capacity (lowest scores
//! first) are dropped on every append.

use crate::errors::StoreResult;
use crate::store::{Command, RangeOrder, ScoredMember, Store};
use std::sync::Arc;

#[derive(Clone)]
pub struct BoundedLog {
    store: Arc<dyn Store>,
    key: String,
    capacity: usize,
}

impl BoundedLog {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key: key.into(),
            capacity,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one entry and trim to capacity in the same breath.
    pub async fn append(&self, score: f64, member: &str) -> StoreResult<()> {
        self.store.zadd(&self.key, score, member).await?;
        self.store
            .zremrange_by_rank(&self.key, 0, -(self.capacity as i64) - 1)
            .await?;
        Ok(())
    }

    /// The append as pipeline commands, for callers batching it with other
    /// writes.
    pub fn append_commands(&self, score: f64, member: &str) -> [Command; 2] {
        [
            Command::ZAdd {
                key: self.key.clone(),
                score,
                member: member.to_string(),
            },
            Command::ZRemRangeByRank {
                key: self.key.clone(),
                start: 0,
                stop: -(self.capacity as i64) - 1,
            },
        ]
    }

    /// Newest `n` entries, highest score first.
    pub async fn recent(&self, n: usize) -> StoreResult<Vec<ScoredMember>> {
        self.store
            .zrange(&self.key, 0, n as i64 - 1, RangeOrder::Descending)
            .await
    }

    /// Every retained entry, oldest first.
    pub async fn all(&self) -> StoreResult<Vec<ScoredMember>> {
        self.store.zrange(&self.key, 0, -1, RangeOrder::Ascending).await
    }

    pub async fn len(&self) -> StoreResult<u64> {
        self.store.zcard(&self.key).await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Replace one entry (e.g. after re-scoring it). The member string is the
    /// identity, so mutated payloads must remove the old form first.
    pub async fn replace(&self, old_member: &str, score: f64, new_member: &str) -> StoreResult<()> {
        self.store.zrem(&self.key, old_member).await?;
        self.append(score, new_member).await
    }

    /// Drop entries with scores at or below `cutoff`.
    pub async fn prune_before(&self, cutoff: f64) -> StoreResult<u64> {
        self.store
            .zremrange_by_score(&self.key, f64::MIN, cutoff)
            .await
    }
}
