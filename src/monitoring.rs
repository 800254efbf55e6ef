//! Monitoring and alerting
//!
//! Tracks:
//! - Operation latency and success, with a global slow-operation set
//! - Daily error and invocation counters per operation
//! - Cache hit rates and average latency
//! - System health classification and a fixed alert rule set
//!
//! Monitoring never fails its callers: every store write here is best effort
//! and degrades to a log line.

use crate::bounded_log::BoundedLog;
use crate::cache::MultiLevelCache;
use crate::config::MonitoringConfig;
use crate::errors::StoreResult;
use crate::schema::keys;
use crate::store::Store;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Cache performance over the cumulative counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsReport {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_response_ms: f64,
    pub memory_entries: usize,
    pub memory_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub store: ComponentHealth,
    pub memory: ComponentHealth,
    pub overall: OverallHealth,
    pub uptime_secs: u64,
    pub last_incident: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowOperation {
    pub operation: String,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorProneOperation {
    pub operation: String,
    pub errors: u64,
    pub invocations: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BottleneckReport {
    pub slow_operations: Vec<SlowOperation>,
    pub error_prone_operations: Vec<ErrorProneOperation>,
    pub cache_inefficiencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub health: SystemHealth,
    pub cache: CacheMetricsReport,
    pub bottlenecks: BottleneckReport,
    pub alerts: Vec<Alert>,
    pub recent_activity: Vec<serde_json::Value>,
}

/// Per-user behavior summary derived from the behavior log.
#[derive(Debug, Clone, Serialize)]
pub struct UserInsights {
    pub total_actions: usize,
    pub favorite_actions: Vec<String>,
    pub last_activity_ms: i64,
}

pub struct Monitoring {
    store: Arc<dyn Store>,
    cache: Arc<MultiLevelCache>,
    config: MonitoringConfig,
    started_at: Instant,
}

impl Monitoring {
    pub fn new(store: Arc<dyn Store>, cache: Arc<MultiLevelCache>, config: MonitoringConfig) -> Self {
        Self {
            store,
            cache,
            config,
            started_at: Instant::now(),
        }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    // =========================================================================
    // Performance tracking
    // =========================================================================

    /// Record one operation sample. Failures feed the error counters, slow
    /// samples additionally land in the global slow-operation set.
    pub async fn track_performance(
        &self,
        operation: &str,
        duration_ms: u64,
        success: bool,
        metadata: serde_json::Value,
    ) {
        let now_ms = Utc::now().timestamp_millis();
        let sample = json!({
            "timestamp_ms": now_ms,
            "operation": operation,
            "duration_ms": duration_ms,
            "success": success,
            "metadata": metadata,
        });

        let log = BoundedLog::new(
            self.store.clone(),
            keys::performance_log(operation),
            self.config.performance_log_capacity,
        );
        if let Err(e) = log.append(now_ms as f64, &sample.to_string()).await {
            debug!(operation, error = %e, "performance sample write failed");
        }

        if let Err(e) = self.store.sadd(&keys::tracked_operations(), operation).await {
            debug!(error = %e, "operation registry update failed");
        }
        if let Err(e) = self
            .store
            .hincrby(&keys::operation_counts(&Self::today()), operation, 1)
            .await
        {
            debug!(error = %e, "operation counter update failed");
        }

        if !success {
            let error = metadata
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error");
            self.track_error(operation, error).await;
        }

        if duration_ms >= self.config.slow_operation_threshold_ms {
            let slow = BoundedLog::new(
                self.store.clone(),
                keys::slow_operations(),
                self.config.slow_log_capacity,
            );
            if let Err(e) = slow.append(duration_ms as f64, &sample.to_string()).await {
                debug!(operation, error = %e, "slow-operation write failed");
            }
        }
    }

    /// Record an error with context and bump the daily per-operation counter.
    pub async fn track_error(&self, operation: &str, error: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let entry = json!({
            "timestamp_ms": now_ms,
            "operation": operation,
            "error": error,
        });

        let log = BoundedLog::new(
            self.store.clone(),
            keys::error_log(),
            self.config.error_log_capacity,
        );
        if let Err(e) = log.append(now_ms as f64, &entry.to_string()).await {
            debug!(operation, error = %e, "error log write failed");
        }
        if let Err(e) = self
            .store
            .hincrby(&keys::error_rates(&Self::today()), operation, 1)
            .await
        {
            debug!(error = %e, "error counter update failed");
        }
    }

    // =========================================================================
    // Cache metrics
    // =========================================================================

    pub async fn cache_metrics(&self) -> CacheMetricsReport {
        let counters = self
            .store
            .hgetall(&keys::cache_performance())
            .await
            .unwrap_or_default();
        let parse = |field: &str| -> u64 {
            counters
                .get(field)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        let hits = parse("hits");
        let misses = parse("misses");
        let total_ms = parse("total_response_ms");
        let total = hits + misses;

        let memory = self.cache.memory_stats();
        CacheMetricsReport {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            avg_response_ms: if total > 0 { total_ms as f64 / total as f64 } else { 0.0 },
            memory_entries: memory.entries,
            memory_capacity: memory.capacity,
        }
    }

    /// Today's error rate: failed invocations over total invocations.
    pub async fn error_rate(&self) -> f64 {
        let today = Self::today();
        let errors: i64 = self
            .store
            .hgetall(&keys::error_rates(&today))
            .await
            .unwrap_or_default()
            .values()
            .filter_map(|v| v.parse::<i64>().ok())
            .sum();
        let total: i64 = self
            .store
            .hgetall(&keys::operation_counts(&today))
            .await
            .unwrap_or_default()
            .values()
            .filter_map(|v| v.parse::<i64>().ok())
            .sum();
        if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        }
    }

    // =========================================================================
    // Health and alerting
    // =========================================================================

    pub async fn system_health(&self) -> SystemHealth {
        let store_health = match self.store.ping().await {
            Ok(()) => ComponentHealth::Healthy,
            Err(_) => ComponentHealth::Unavailable,
        };

        let memory_stats = self.cache.memory_stats();
        let memory_health = if memory_stats.fill_ratio > 0.9 {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Healthy
        };

        let error_rate = self.error_rate().await;
        let cache = self.cache_metrics().await;

        let mut overall = OverallHealth::Healthy;
        if error_rate > 0.25 {
            overall = OverallHealth::Critical;
        } else if error_rate > 0.1 {
            overall = OverallHealth::Degraded;
        }
        let had_traffic = cache.hits + cache.misses > 0;
        if had_traffic && cache.hit_rate < 0.5 && overall == OverallHealth::Healthy {
            overall = OverallHealth::Degraded;
        }
        if store_health == ComponentHealth::Unavailable && overall == OverallHealth::Healthy {
            overall = OverallHealth::Degraded;
        }

        let last_incident = self.last_incident().await;
        if last_incident.is_some() && overall == OverallHealth::Healthy {
            overall = OverallHealth::Degraded;
        }

        SystemHealth {
            store: store_health,
            memory: memory_health,
            overall,
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_incident,
        }
    }

    /// The most recent error, if it happened within the last hour.
    async fn last_incident(&self) -> Option<String> {
        let log = BoundedLog::new(
            self.store.clone(),
            keys::error_log(),
            self.config.error_log_capacity,
        );
        let recent = log.recent(1).await.ok()?;
        let entry = recent.first()?;
        let parsed: serde_json::Value = serde_json::from_str(&entry.member).ok()?;
        let timestamp_ms = parsed.get("timestamp_ms")?.as_i64()?;
        let age_ms = Utc::now().timestamp_millis() - timestamp_ms;
        if age_ms > 3_600_000 {
            return None;
        }
        let message = parsed.get("error")?.as_str()?.to_string();
        Some(format!("error {:.1}h ago: {}", age_ms as f64 / 3_600_000.0, message))
    }

    /// Evaluate the fixed alert rule set.
    pub async fn check_alerts(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let cache = self.cache_metrics().await;

        if cache.hits + cache.misses > 0 && cache.hit_rate < self.config.hit_rate_floor {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                message: "cache hit rate is below the configured floor".to_string(),
                metric: "cache_hit_rate".to_string(),
                value: cache.hit_rate,
                threshold: self.config.hit_rate_floor,
            });
        }

        let error_rate = self.error_rate().await;
        if error_rate > self.config.error_rate_ceiling {
            alerts.push(Alert {
                level: AlertLevel::Error,
                message: "error rate is above the configured ceiling".to_string(),
                metric: "error_rate".to_string(),
                value: error_rate,
                threshold: self.config.error_rate_ceiling,
            });
        }

        if cache.avg_response_ms > self.config.latency_ceiling_ms {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                message: "average response time is too high".to_string(),
                metric: "avg_response_ms".to_string(),
                value: cache.avg_response_ms,
                threshold: self.config.latency_ceiling_ms,
            });
        }

        alerts
    }

    // =========================================================================
    // Reports
    // =========================================================================

    pub async fn bottlenecks(&self) -> BottleneckReport {
        let slow_log = BoundedLog::new(
            self.store.clone(),
            keys::slow_operations(),
            self.config.slow_log_capacity,
        );
        let slow_operations = slow_log
            .recent(10)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let parsed: serde_json::Value = serde_json::from_str(&entry.member).ok()?;
                Some(SlowOperation {
                    operation: parsed.get("operation")?.as_str()?.to_string(),
                    duration_ms: entry.score,
                })
            })
            .collect();

        let today = Self::today();
        let errors = self
            .store
            .hgetall(&keys::error_rates(&today))
            .await
            .unwrap_or_default();
        let totals = self
            .store
            .hgetall(&keys::operation_counts(&today))
            .await
            .unwrap_or_default();
        let mut error_prone: Vec<ErrorProneOperation> = errors
            .iter()
            .filter_map(|(operation, count)| {
                let errors: u64 = count.parse().ok()?;
                let invocations: u64 = totals.get(operation).and_then(|t| t.parse().ok())?;
                Some(ErrorProneOperation {
                    operation: operation.clone(),
                    errors,
                    invocations,
                    error_rate: if invocations > 0 {
                        errors as f64 / invocations as f64
                    } else {
                        0.0
                    },
                })
            })
            .collect();
        error_prone.sort_by(|a, b| {
            b.error_rate
                .partial_cmp(&a.error_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        error_prone.truncate(5);

        let cache = self.cache_metrics().await;
        let mut cache_inefficiencies = Vec::new();
        if cache.hits + cache.misses > 0 && cache.hit_rate < 0.7 {
            cache_inefficiencies.push(format!("low hit rate: {:.1}%", cache.hit_rate * 100.0));
        }
        if cache.avg_response_ms > 200.0 {
            cache_inefficiencies.push(format!("slow responses: {:.0}ms avg", cache.avg_response_ms));
        }

        BottleneckReport {
            slow_operations,
            error_prone_operations: error_prone,
            cache_inefficiencies,
        }
    }

    pub async fn dashboard(&self) -> Dashboard {
        let health = self.system_health().await;
        let cache = self.cache_metrics().await;
        let bottlenecks = self.bottlenecks().await;
        let alerts = self.check_alerts().await;

        let error_log = BoundedLog::new(
            self.store.clone(),
            keys::error_log(),
            self.config.error_log_capacity,
        );
        let recent_activity = error_log
            .recent(10)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry.member).ok())
            .collect();

        Dashboard {
            health,
            cache,
            bottlenecks,
            alerts,
            recent_activity,
        }
    }

    /// Summarize a user's behavior log.
    pub async fn user_insights(&self, address: &str) -> UserInsights {
        let events = self
            .store
            .zrange(
                &keys::user_behavior(address),
                0,
                -1,
                crate::store::RangeOrder::Ascending,
            )
            .await
            .unwrap_or_default();

        let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut last_activity_ms = 0i64;
        for entry in &events {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&entry.member) {
                if let Some(action) = parsed.get("action").and_then(|a| a.as_str()) {
                    *counts.entry(action.to_string()).or_default() += 1;
                }
            }
            last_activity_ms = last_activity_ms.max(entry.score as i64);
        }

        let mut favorite_actions: Vec<(String, usize)> = counts.into_iter().collect();
        favorite_actions.sort_by(|a, b| b.1.cmp(&a.1));

        UserInsights {
            total_actions: events.len(),
            favorite_actions: favorite_actions.into_iter().take(5).map(|(a, _)| a).collect(),
            last_activity_ms,
        }
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Prune performance, error, and slow-operation logs older than the
    /// retention window.
    pub async fn cleanup_old_metrics(&self, retention_days: u32) -> StoreResult<u64> {
        let cutoff_ms = Utc::now().timestamp_millis() - i64::from(retention_days) * 86_400_000;
        let cutoff = cutoff_ms as f64;
        let mut removed = 0;

        removed += self
            .store
            .zremrange_by_score(&keys::error_log(), f64::MIN, cutoff)
            .await?;
        // The slow set is scored by duration, not time; prune via the
        // embedded timestamp instead.
        let slow = self
            .store
            .zrange(&keys::slow_operations(), 0, -1, crate::store::RangeOrder::Ascending)
            .await?;
        for entry in slow {
            let too_old = serde_json::from_str::<serde_json::Value>(&entry.member)
                .ok()
                .and_then(|v| v.get("timestamp_ms").and_then(|t| t.as_i64()))
                .is_some_and(|t| t < cutoff_ms);
            if too_old && self.store.zrem(&keys::slow_operations(), &entry.member).await? {
                removed += 1;
            }
        }

        for operation in self.store.smembers(&keys::tracked_operations()).await? {
            removed += self
                .store
                .zremrange_by_score(&keys::performance_log(&operation), f64::MIN, cutoff)
                .await?;
        }

        if removed > 0 {
            warn!(removed, retention_days, "pruned old metrics");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::InMemoryStore;

    fn setup() -> (Monitoring, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MultiLevelCache::new(store.clone(), CacheConfig::default()));
        (
            Monitoring::new(store.clone(), cache, MonitoringConfig::default()),
            store,
        )
    }

    #[tokio::test]
    async fn failures_raise_error_rate() {
        let (monitoring, _) = setup();

        for _ in 0..8 {
            monitoring
                .track_performance("transfer", 20, true, json!({}))
                .await;
        }
        for _ in 0..2 {
            monitoring
                .track_performance("transfer", 20, false, json!({"error": "boom"}))
                .await;
        }

        let rate = monitoring.error_rate().await;
        assert!((rate - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn slow_operations_are_ranked() {
        let (monitoring, store) = setup();

        monitoring
            .track_performance("batch_mint", 5_000, true, json!({}))
            .await;
        monitoring
            .track_performance("transfer", 10, true, json!({}))
            .await;

        let slow = store
            .zrange(&keys::slow_operations(), 0, -1, crate::store::RangeOrder::Descending)
            .await
            .unwrap();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].score, 5_000.0);
    }

    #[tokio::test]
    async fn health_degrades_on_high_error_rate() {
        let (monitoring, _) = setup();

        for _ in 0..5 {
            monitoring
                .track_performance("transfer", 20, false, json!({"error": "store down"}))
                .await;
        }

        let health = monitoring.system_health().await;
        assert_eq!(health.overall, OverallHealth::Critical);
        assert!(health.last_incident.is_some());
    }

    #[tokio::test]
    async fn alerts_fire_on_error_ceiling() {
        let (monitoring, _) = setup();
        monitoring
            .track_performance("transfer", 20, false, json!({"error": "boom"}))
            .await;

        let alerts = monitoring.check_alerts().await;
        assert!(alerts.iter().any(|a| a.metric == "error_rate"));
    }

    #[tokio::test]
    async fn quiet_system_is_healthy() {
        let (monitoring, _) = setup();
        let health = monitoring.system_health().await;
        assert_eq!(health.overall, OverallHealth::Healthy);
    }
}
