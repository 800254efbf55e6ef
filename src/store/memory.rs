//! In-memory reference backend for the [`Store`] trait
//!
//! Backed by a `DashMap` with lazy per-entry TTL. Used by tests and local
//! development; a networked backend drops in behind the same trait. Semantics
//! follow the external service: single commands are atomic, pipelines report
//! per-command results, rank ranges accept negative (from-the-end) indices.

use super::{Command, RangeOrder, Reply, ScoredMember, Store};
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    SortedSet(HashMap<String, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Text(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// DashMap-backed store with lazy TTL expiry.
#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<String, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys. Test and diagnostics helper.
    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL for a key, if one is set. Test helper.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.data
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(Instant::now()))
    }

    /// Force a key to expire immediately. Test helper for TTL-driven sweeps.
    pub fn force_expire(&self, key: &str) {
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = Some(Instant::now());
        }
    }

    fn purge_if_expired(&self, key: &str) {
        let expired = self.data.get(key).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            self.data.remove(key);
        }
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType {
            key: key.to_string(),
        }
    }

    fn sorted_pairs(zset: &HashMap<String, f64>, order: RangeOrder) -> Vec<ScoredMember> {
        let mut pairs: Vec<ScoredMember> = zset
            .iter()
            .map(|(m, s)| ScoredMember::new(m.clone(), *s))
            .collect();
        pairs.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.member.cmp(&b.member))
        });
        if order == RangeOrder::Descending {
            pairs.reverse();
        }
        pairs
    }

    /// Inclusive rank range with negative-from-the-end semantics.
    fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
        if len == 0 {
            return None;
        }
        let n = len as i64;
        let mut s = if start < 0 { n + start } else { start };
        let mut e = if stop < 0 { n + stop } else { stop };
        s = s.max(0);
        e = e.min(n - 1);
        if s > e {
            return None;
        }
        Some((s as usize, e as usize))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::Text(s) => Ok(Some(s.clone())),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.data
            .insert(key.to_string(), Entry::new(Value::Text(value.to_string())));
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> StoreResult<()> {
        let mut entry = Entry::new(Value::Text(value.to_string()));
        entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        self.data.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        Ok(self.data.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.purge_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.get(field).cloned()),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.purge_if_expired(key);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.clone()),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.purge_if_expired(key);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                let current = map
                    .get(field)
                    .map(|v| {
                        v.parse::<i64>().map_err(|_| StoreError::CommandFailed {
                            command: format!("HINCRBY {key}"),
                            reason: format!("field {field} is not an integer"),
                        })
                    })
                    .transpose()?
                    .unwrap_or(0);
                let next = current + delta;
                map.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::Set(set) => Ok(set.remove(member)),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.contains(member)),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(false),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.len() as u64),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn srandmember(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut members = self.smembers(key).await?;
        members.shuffle(&mut rand::thread_rng());
        members.truncate(count);
        Ok(members)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.purge_if_expired(key);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::SortedSet(HashMap::new())));
        match &mut entry.value {
            Value::SortedSet(zset) => {
                zset.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn zincrby(&self, key: &str, delta: f64, member: &str) -> StoreResult<f64> {
        self.purge_if_expired(key);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::SortedSet(HashMap::new())));
        match &mut entry.value {
            Value::SortedSet(zset) => {
                let score = zset.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::SortedSet(zset) => Ok(zset.get(member).copied()),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::SortedSet(zset) => Ok(zset.len() as u64),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::SortedSet(zset) => Ok(zset.remove(member).is_some()),
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(false),
        }
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        order: RangeOrder,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::SortedSet(zset) => {
                    let pairs = Self::sorted_pairs(zset, order);
                    Ok(match Self::resolve_range(pairs.len(), start, stop) {
                        Some((s, e)) => pairs[s..=e].to_vec(),
                        None => Vec::new(),
                    })
                }
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<ScoredMember>> {
        self.purge_if_expired(key);
        match self.data.get(key) {
            Some(entry) => match &entry.value {
                Value::SortedSet(zset) => {
                    let pairs = Self::sorted_pairs(zset, RangeOrder::Ascending);
                    Ok(pairs
                        .into_iter()
                        .filter(|p| p.score >= min && p.score <= max)
                        .collect())
                }
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn zremrange_by_rank(&self, key: &str, start: i64, stop: i64) -> StoreResult<u64> {
        self.purge_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::SortedSet(zset) => {
                    let pairs = Self::sorted_pairs(zset, RangeOrder::Ascending);
                    let Some((s, e)) = Self::resolve_range(pairs.len(), start, stop) else {
                        return Ok(0);
                    };
                    let mut removed = 0;
                    for pair in &pairs[s..=e] {
                        if zset.remove(&pair.member).is_some() {
                            removed += 1;
                        }
                    }
                    Ok(removed)
                }
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn zremrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.purge_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::SortedSet(zset) => {
                    let doomed: Vec<String> = zset
                        .iter()
                        .filter(|(_, s)| **s >= min && **s <= max)
                        .map(|(m, _)| m.clone())
                        .collect();
                    for member in &doomed {
                        zset.remove(member);
                    }
                    Ok(doomed.len() as u64)
                }
                _ => Err(Self::wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<StoreResult<Reply>>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = match &command {
                Command::Get { key } => self.get(key).await.map(Reply::Value),
                Command::Set { key, value } => self.set(key, value).await.map(|_| Reply::Unit),
                Command::SetEx {
                    key,
                    ttl_secs,
                    value,
                } => self.setex(key, *ttl_secs, value).await.map(|_| Reply::Unit),
                Command::Del { key } => self.del(key).await.map(Reply::Bool),
                Command::Expire { key, ttl_secs } => {
                    self.expire(key, *ttl_secs).await.map(Reply::Bool)
                }
                Command::HSet { key, fields } => self.hset(key, fields).await.map(|_| Reply::Unit),
                Command::HIncrBy { key, field, delta } => {
                    self.hincrby(key, field, *delta).await.map(Reply::Int)
                }
                Command::SAdd { key, member } => self.sadd(key, member).await.map(Reply::Bool),
                Command::SRem { key, member } => self.srem(key, member).await.map(Reply::Bool),
                Command::ZAdd { key, score, member } => {
                    self.zadd(key, *score, member).await.map(|_| Reply::Unit)
                }
                Command::ZIncrBy { key, delta, member } => {
                    self.zincrby(key, *delta, member).await.map(Reply::Float)
                }
                Command::ZRem { key, member } => self.zrem(key, member).await.map(Reply::Bool),
                Command::ZRemRangeByRank { key, start, stop } => self
                    .zremrange_by_rank(key, *start, *stop)
                    .await
                    .map(|n| Reply::Int(n as i64)),
                Command::ZRemRangeByScore { key, min, max } => self
                    .zremrange_by_score(key, *min, *max)
                    .await
                    .map(|n| Reply::Int(n as i64)),
            };
            results.push(result.map_err(|e| StoreError::command_failed(&command, e.to_string())));
        }
        Ok(results)
    }
}
