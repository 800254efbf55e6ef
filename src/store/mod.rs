//! Persistent store boundary
//!
//! The shared key-value service behind the cache is abstracted as the [`Store`]
//! trait: plain strings, hashes, sets, and sorted sets, plus a pipeline
//! primitive. Every component receives its store handle by constructor
//! injection; there are no module-level singletons.
//!
//! The pipeline contract mirrors the real service: commands submitted together
//! execute together, but each reports success or failure independently. It is
//! NOT a transaction, and callers that need multi-step consistency must check
//! every slot of the result and compensate on partial failure.

pub mod memory;

pub use memory::InMemoryStore;

use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;

/// A member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// Rank-range ordering for sorted-set reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOrder {
    /// Lowest score first.
    Ascending,
    /// Highest score first.
    Descending,
}

/// A single command in a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    SetEx { key: String, ttl_secs: u64, value: String },
    Del { key: String },
    Expire { key: String, ttl_secs: u64 },
    HSet { key: String, fields: Vec<(String, String)> },
    HIncrBy { key: String, field: String, delta: i64 },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    ZIncrBy { key: String, delta: f64, member: String },
    ZRem { key: String, member: String },
    ZRemRangeByRank { key: String, start: i64, stop: i64 },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
}

impl Command {
    /// Short command name for error reporting.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::SetEx { .. } => "SETEX",
            Command::Del { .. } => "DEL",
            Command::Expire { .. } => "EXPIRE",
            Command::HSet { .. } => "HSET",
            Command::HIncrBy { .. } => "HINCRBY",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::ZAdd { .. } => "ZADD",
            Command::ZIncrBy { .. } => "ZINCRBY",
            Command::ZRem { .. } => "ZREM",
            Command::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
        }
    }

    /// The key this command touches, for failure reporting.
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::SetEx { key, .. }
            | Command::Del { key }
            | Command::Expire { key, .. }
            | Command::HSet { key, .. }
            | Command::HIncrBy { key, .. }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZIncrBy { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZRemRangeByRank { key, .. }
            | Command::ZRemRangeByScore { key, .. } => key,
        }
    }
}

/// Result of one pipelined command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Unit,
    Int(i64),
    Float(f64),
    Bool(bool),
    Value(Option<String>),
}

/// Shared key-value service boundary.
///
/// Single commands are atomic; `pipeline` batches are not. A real network
/// backend (Redis or compatible) and the in-memory reference backend both live
/// behind this trait.
#[async_trait]
pub trait Store: Send + Sync {
    // Strings
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;

    // Hashes
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn scard(&self, key: &str) -> StoreResult<u64>;
    async fn srandmember(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    // Sorted sets
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()>;
    async fn zincrby(&self, key: &str, delta: f64, member: &str) -> StoreResult<f64>;
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;
    async fn zcard(&self, key: &str) -> StoreResult<u64>;
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        order: RangeOrder,
    ) -> StoreResult<Vec<ScoredMember>>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<ScoredMember>>;
    async fn zremrange_by_rank(&self, key: &str, start: i64, stop: i64) -> StoreResult<u64>;
    async fn zremrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;

    /// Execute a batch of commands together. The outer error is a transport
    /// failure (nothing executed); the inner slots report per-command
    /// success/failure. Partial failure leaves earlier commands applied.
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<StoreResult<Reply>>>;
}

/// Collect failure descriptions from a pipeline result, preserving slot order.
pub fn pipeline_failures(commands: &[Command], results: &[StoreResult<Reply>]) -> Vec<String> {
    commands
        .iter()
        .zip(results.iter())
        .filter_map(|(cmd, res)| {
            res.as_ref()
                .err()
                .map(|e| format!("{} {}: {}", cmd.name(), cmd.key(), e))
        })
        .collect()
}

impl StoreError {
    pub(crate) fn command_failed(command: &Command, reason: impl Into<String>) -> Self {
        StoreError::CommandFailed {
            command: format!("{} {}", command.name(), command.key()),
            reason: reason.into(),
        }
    }
}
