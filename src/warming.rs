//! Predictive cache warming from user behavior
//!
//! Every user action lands in a bounded behavior log. Predictions combine
//! four sources with additive confidence weights, capped at 1.0:
//!
//! - recently viewed tokens (+0.4)
//! - tokens the user currently owns (+0.6)
//! - tokens sharing the user's most-used trait filters (+0.2)
//! - globally trending tokens (+0.1)
//!
//! When the combined confidence clears the configured threshold, the predicted
//! tokens are loaded from their canonical records into both cache tiers.
//! Every prediction batch is persisted so later accesses can be scored for
//! accuracy.

use crate::bounded_log::BoundedLog;
use crate::cache::MultiLevelCache;
use crate::config::WarmingConfig;
use crate::entities::Entities;
use crate::errors::Result;
use crate::schema::{keys, TokenId, TraitId};
use crate::store::{RangeOrder, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ACTION_VIEW_TOKEN: &str = "view_token";
pub const ACTION_FILTER_BY_TRAIT: &str = "filter_by_trait";

/// One entry in a user's behavior log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trait_id: Option<String>,
    pub timestamp_ms: i64,
}

impl BehaviorEvent {
    pub fn view_token(token: &TokenId) -> Self {
        Self {
            action: ACTION_VIEW_TOKEN.to_string(),
            token: Some(token.to_string()),
            trait_id: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn filter_by_trait(trait_id: &TraitId) -> Self {
        Self {
            action: ACTION_FILTER_BY_TRAIT.to_string(),
            token: None,
            trait_id: Some(trait_id.to_string()),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Patterns distilled from a user's recent actions.
#[derive(Debug, Clone, Default)]
pub struct BehaviorProfile {
    /// Unique recently viewed tokens, newest first.
    pub recent_views: Vec<String>,
    /// Trait filter usage counts.
    pub trait_filters: HashMap<String, u32>,
    pub last_action_ms: i64,
}

/// A persisted prediction batch, scored for accuracy once the user accesses
/// one of its tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PredictionRecord {
    id: String,
    tokens: Vec<String>,
    confidence: f64,
    reasoning: String,
    scored: bool,
    accurate: bool,
    created_ms: i64,
}

/// Outcome of a prediction pass.
#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    pub tokens: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
}

/// Outcome of a warm-for-user pass.
#[derive(Debug, Clone)]
pub struct WarmReport {
    pub predicted: usize,
    pub warmed: usize,
    pub confidence: f64,
}

/// Accuracy statistics over persisted prediction batches.
#[derive(Debug, Clone)]
pub struct PredictionStats {
    pub overall_accuracy: f64,
    pub total_predictions: usize,
    pub accurate_predictions: usize,
    pub average_confidence: f64,
}

pub struct PredictiveWarmer {
    store: Arc<dyn Store>,
    cache: Arc<MultiLevelCache>,
    entities: Entities,
    config: WarmingConfig,
}

impl PredictiveWarmer {
    pub fn new(store: Arc<dyn Store>, cache: Arc<MultiLevelCache>, config: WarmingConfig) -> Self {
        let entities = Entities::new(store.clone());
        Self {
            store,
            cache,
            entities,
            config,
        }
    }

    fn behavior_log(&self, user: &str) -> BoundedLog {
        BoundedLog::new(
            self.store.clone(),
            keys::user_behavior(user),
            self.config.behavior_log_capacity,
        )
    }

    fn prediction_log(&self, user: &str) -> BoundedLog {
        BoundedLog::new(
            self.store.clone(),
            keys::predictions(user),
            self.config.prediction_history_capacity,
        )
    }

    // =========================================================================
    // Behavior log
    // =========================================================================

    /// Append an action to the user's behavior log; token views also bump the
    /// global trending set.
    pub async fn record_action(&self, user: &str, event: BehaviorEvent) -> Result<()> {
        let member = serde_json::to_string(&event).map_err(|e| {
            crate::errors::SerializationError::Encode {
                context: "behavior event".to_string(),
                reason: e.to_string(),
            }
        })?;
        self.behavior_log(user)
            .append(event.timestamp_ms as f64, &member)
            .await?;

        if event.action == ACTION_VIEW_TOKEN {
            if let Some(token) = &event.token {
                if let Err(e) = self.store.zincrby(&keys::trending_tokens(), 1.0, token).await {
                    debug!(error = %e, "trending bump failed");
                }
            }
        }
        Ok(())
    }

    /// Distill recent actions into view and filter patterns.
    pub async fn analyze_behavior(&self, user: &str) -> Result<BehaviorProfile> {
        let entries = self
            .behavior_log(user)
            .recent(self.config.behavior_log_capacity)
            .await?;

        let mut profile = BehaviorProfile::default();
        for entry in &entries {
            let Ok(event) = serde_json::from_str::<BehaviorEvent>(&entry.member) else {
                continue;
            };
            profile.last_action_ms = profile.last_action_ms.max(event.timestamp_ms);
            match event.action.as_str() {
                ACTION_VIEW_TOKEN => {
                    if let Some(token) = event.token {
                        if !profile.recent_views.contains(&token) {
                            profile.recent_views.push(token);
                        }
                    }
                }
                ACTION_FILTER_BY_TRAIT => {
                    if let Some(trait_id) = event.trait_id {
                        *profile.trait_filters.entry(trait_id).or_default() += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(profile)
    }

    // =========================================================================
    // Predictions
    // =========================================================================

    /// Combine the four prediction sources into a deduplicated,
    /// confidence-weighted token list.
    pub async fn generate_predictions(&self, user: &str) -> Result<PredictionOutcome> {
        let profile = self.analyze_behavior(user).await?;

        let mut tokens: Vec<String> = Vec::new();
        let mut confidence: f64 = 0.0;
        let mut reasons: Vec<&str> = Vec::new();
        let push_unique = |list: &mut Vec<String>, token: String| {
            if !list.contains(&token) {
                list.push(token);
            }
        };

        if !profile.recent_views.is_empty() {
            for token in profile.recent_views.iter().take(3) {
                push_unique(&mut tokens, token.clone());
            }
            confidence += 0.4;
            reasons.push("recently viewed tokens");
        }

        let owned = self.entities.user_tokens(user).await?;
        if !owned.is_empty() {
            for token in owned.iter().take(5) {
                push_unique(&mut tokens, token.clone());
            }
            confidence += 0.6;
            reasons.push("user-owned tokens");
        }

        let similar = self.similar_trait_tokens(&profile).await;
        if !similar.is_empty() {
            for token in similar.into_iter().take(2) {
                push_unique(&mut tokens, token);
            }
            confidence += 0.2;
            reasons.push("tokens matching favored traits");
        }

        let trending = self.trending_tokens(2).await;
        if !trending.is_empty() {
            for token in trending {
                push_unique(&mut tokens, token);
            }
            confidence += 0.1;
            reasons.push("currently trending tokens");
        }

        tokens.truncate(self.config.max_predictions);
        Ok(PredictionOutcome {
            tokens,
            confidence: confidence.min(1.0),
            reasoning: reasons.join(", "),
        })
    }

    /// Tokens carrying the user's two most-used trait filters.
    async fn similar_trait_tokens(&self, profile: &BehaviorProfile) -> Vec<String> {
        let mut filters: Vec<(&String, &u32)> = profile.trait_filters.iter().collect();
        filters.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        let mut tokens = Vec::new();
        for (trait_raw, _) in filters.into_iter().take(2) {
            let Ok(trait_id) = TraitId::from_str(trait_raw) else {
                continue;
            };
            match self.entities.trait_tokens(&trait_id).await {
                Ok(members) => tokens.extend(members.into_iter().take(3)),
                Err(e) => debug!(trait_id = %trait_id, error = %e, "trait token read failed"),
            }
        }
        tokens
    }

    async fn trending_tokens(&self, n: usize) -> Vec<String> {
        match self
            .store
            .zrange(&keys::trending_tokens(), 0, n as i64 - 1, RangeOrder::Descending)
            .await
        {
            Ok(entries) => entries.into_iter().map(|e| e.member).collect(),
            Err(e) => {
                debug!(error = %e, "trending read failed");
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Warming
    // =========================================================================

    /// Generate predictions for a user and warm the cache when confidence
    /// clears the threshold. The prediction batch is persisted for accuracy
    /// scoring either way it is used.
    pub async fn warm_for_user(&self, user: &str) -> Result<WarmReport> {
        let prediction = self.generate_predictions(user).await?;
        if prediction.tokens.is_empty() {
            return Ok(WarmReport {
                predicted: 0,
                warmed: 0,
                confidence: prediction.confidence,
            });
        }

        let mut warmed = 0;
        if prediction.confidence > self.config.confidence_threshold {
            info!(
                user,
                tokens = prediction.tokens.len(),
                confidence = prediction.confidence,
                "warming predicted tokens"
            );
            warmed = self.warm_tokens(&prediction.tokens).await;
            self.persist_prediction(user, &prediction).await?;
        }

        Ok(WarmReport {
            predicted: prediction.tokens.len(),
            warmed,
            confidence: prediction.confidence,
        })
    }

    /// Load canonical token records into both cache tiers. Tokens without a
    /// record are skipped.
    pub async fn warm_tokens(&self, tokens: &[String]) -> usize {
        let ttl = self.cache.policy().token;
        let loads = tokens.iter().map(|raw_id| {
            let entities = self.entities.clone();
            async move {
                let token_id = TokenId::from_str(raw_id).ok()?;
                match entities.get_token(&token_id).await {
                    Ok(Some(record)) => {
                        let payload = serde_json::json!({
                            "id": token_id.to_string(),
                            "owner": record.owner,
                            "name": record.name,
                            "traits": record.traits.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                            "dynamic": record.dynamic,
                        });
                        Some((keys::cache_token(&token_id), payload))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(token = %raw_id, error = %e, "warm load failed");
                        None
                    }
                }
            }
        });

        let mut warmed = 0;
        for loaded in futures::future::join_all(loads).await.into_iter().flatten() {
            let (key, payload) = loaded;
            self.cache.set(&key, &payload, &ttl).await;
            warmed += 1;
        }
        warmed
    }

    async fn persist_prediction(&self, user: &str, prediction: &PredictionOutcome) -> Result<()> {
        let record = PredictionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tokens: prediction.tokens.clone(),
            confidence: prediction.confidence,
            reasoning: prediction.reasoning.clone(),
            scored: false,
            accurate: false,
            created_ms: Utc::now().timestamp_millis(),
        };
        let member = serde_json::to_string(&record).map_err(|e| {
            crate::errors::SerializationError::Encode {
                context: "prediction record".to_string(),
                reason: e.to_string(),
            }
        })?;
        self.prediction_log(user)
            .append(record.created_ms as f64, &member)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Accuracy tracking
    // =========================================================================

    /// Mark the newest unscored prediction containing the accessed token as
    /// accurate. One access scores at most one batch.
    pub async fn track_accuracy(&self, user: &str, accessed: &TokenId) -> Result<()> {
        let log = self.prediction_log(user);
        let recent = log.recent(10).await?;
        let accessed_raw = accessed.to_string();

        for entry in recent {
            let Ok(mut record) = serde_json::from_str::<PredictionRecord>(&entry.member) else {
                continue;
            };
            if record.scored || !record.tokens.contains(&accessed_raw) {
                continue;
            }
            record.scored = true;
            record.accurate = true;
            let updated = serde_json::to_string(&record).map_err(|e| {
                crate::errors::SerializationError::Encode {
                    context: "prediction record".to_string(),
                    reason: e.to_string(),
                }
            })?;
            log.replace(&entry.member, Utc::now().timestamp_millis() as f64, &updated)
                .await?;
            break;
        }
        Ok(())
    }

    /// Accuracy over the user's retained prediction batches.
    pub async fn prediction_stats(&self, user: &str) -> Result<PredictionStats> {
        let entries = self.prediction_log(user).all().await?;
        let records: Vec<PredictionRecord> = entries
            .iter()
            .filter_map(|e| serde_json::from_str(&e.member).ok())
            .collect();

        let scored: Vec<&PredictionRecord> = records.iter().filter(|r| r.scored).collect();
        let accurate = scored.iter().filter(|r| r.accurate).count();
        let average_confidence = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.confidence).sum::<f64>() / records.len() as f64
        };

        Ok(PredictionStats {
            overall_accuracy: if scored.is_empty() {
                0.0
            } else {
                accurate as f64 / scored.len() as f64
            },
            total_predictions: records.len(),
            accurate_predictions: accurate,
            average_confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::entities::{DynamicState, TokenRecord};
    use crate::store::InMemoryStore;

    fn setup() -> (PredictiveWarmer, Arc<MultiLevelCache>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MultiLevelCache::new(store.clone(), CacheConfig::default()));
        let warmer = PredictiveWarmer::new(store.clone(), cache.clone(), WarmingConfig::default());
        (warmer, cache, store)
    }

    async fn seed_token(store: &Arc<InMemoryStore>, number: u64, owner: &str) -> TokenId {
        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        let id = TokenId::new(8453, "0xrug", number).unwrap();
        let record = TokenRecord {
            id: id.clone(),
            owner: owner.to_string(),
            name: format!("Rug #{number}"),
            description: String::new(),
            image: String::new(),
            animation_url: String::new(),
            traits: Vec::new(),
            dynamic: DynamicState::default(),
            metadata_hash: String::new(),
            last_refresh: Utc::now(),
            created_at: Utc::now(),
        };
        entities.put_token(&record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn owned_tokens_dominate_predictions() {
        let (warmer, _, store) = setup();
        let id = seed_token(&store, 1, "0xa").await;
        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        entities.add_token_to_user("0xa", &id).await.unwrap();

        let prediction = warmer.generate_predictions("0xa").await.unwrap();
        assert!(prediction.tokens.contains(&id.to_string()));
        assert!((prediction.confidence - 0.6).abs() < 1e-9);
        assert!(prediction.reasoning.contains("user-owned"));
    }

    #[tokio::test]
    async fn views_and_ownership_stack_confidence() {
        let (warmer, _, store) = setup();
        let owned = seed_token(&store, 1, "0xa").await;
        let viewed = seed_token(&store, 2, "0xb").await;
        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        entities.add_token_to_user("0xa", &owned).await.unwrap();

        warmer
            .record_action("0xa", BehaviorEvent::view_token(&viewed))
            .await
            .unwrap();

        let prediction = warmer.generate_predictions("0xa").await.unwrap();
        // viewed (0.4) + owned (0.6) + trending (0.1, bumped by the view)
        assert!(prediction.confidence >= 1.0);
        assert!(prediction.tokens.contains(&owned.to_string()));
        assert!(prediction.tokens.contains(&viewed.to_string()));
    }

    #[tokio::test]
    async fn warm_populates_cache_from_records() {
        let (warmer, cache, store) = setup();
        let id = seed_token(&store, 3, "0xa").await;
        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        entities.add_token_to_user("0xa", &id).await.unwrap();

        let report = warmer.warm_for_user("0xa").await.unwrap();
        assert_eq!(report.warmed, 1);

        let ttl = cache.policy().token;
        let lookup = cache.get(&keys::cache_token(&id), &ttl).await;
        assert!(lookup.hit);
    }

    #[tokio::test]
    async fn accuracy_marks_one_batch_per_access() {
        let (warmer, _, store) = setup();
        let id = seed_token(&store, 4, "0xa").await;
        let entities = Entities::new(store.clone() as Arc<dyn Store>);
        entities.add_token_to_user("0xa", &id).await.unwrap();

        warmer.warm_for_user("0xa").await.unwrap();
        warmer.track_accuracy("0xa", &id).await.unwrap();

        let stats = warmer.prediction_stats("0xa").await.unwrap();
        assert_eq!(stats.total_predictions, 1);
        assert_eq!(stats.accurate_predictions, 1);
        assert!((stats.overall_accuracy - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn behavior_log_is_bounded() {
        let (warmer, _, store) = setup();
        let id = seed_token(&store, 5, "0xa").await;

        for _ in 0..150 {
            warmer
                .record_action("0xa", BehaviorEvent::view_token(&id))
                .await
                .unwrap();
        }

        let len = store.zcard(&keys::user_behavior("0xa")).await.unwrap();
        assert!(len <= 100);
    }
}
