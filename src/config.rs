//! Configuration management for the rug cache
//!
//! Provides:
//! - Typed configuration for every subsystem
//! - TOML file loading
//! - Environment variable overrides
//! - Validation on load

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RugCacheConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub warming: WarmingConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

/// Persistent store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL of the shared key-value service.
    pub url: String,
    /// Per-command timeout. A timed-out read is a cache miss, a timed-out
    /// write is a failed operation.
    pub command_timeout_ms: u64,
}

/// Multi-level cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries in the L1 memory tier.
    pub l1_capacity: usize,
    /// Interval of the expired-entry sweep over the L1 tier.
    pub sweep_interval_secs: u64,
    /// TTLs per data class.
    pub ttl: TtlPolicy,
}

/// Store-tier / memory-tier TTL pair for one data class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TtlPair {
    pub store_ttl_secs: u64,
    pub memory_ttl_secs: u64,
}

impl TtlPair {
    pub fn store_ttl(&self) -> Duration {
        Duration::from_secs(self.store_ttl_secs)
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }
}

/// TTL strategy by data class. Collection pages aggregate many mutable tokens
/// and get the shortest TTLs of all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    /// Full token records.
    pub token: TtlPair,
    /// Static metadata, fixed at mint.
    pub static_metadata: TtlPair,
    /// Dynamic state (dirt, aging, counters).
    pub dynamic_state: TtlPair,
    /// Paginated collection views.
    pub collection_page: TtlPair,
    /// Per-owner portfolio views.
    pub owner_portfolio: TtlPair,
}

/// Predictive warming settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    /// Most recent actions retained per user.
    pub behavior_log_capacity: usize,
    /// Prediction batches retained per user for accuracy scoring.
    pub prediction_history_capacity: usize,
    /// Minimum combined confidence before a batch is warmed.
    pub confidence_threshold: f64,
    /// Maximum tokens per prediction batch.
    pub max_predictions: usize,
}

/// Monitoring and alerting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Durations above this are recorded in the slow-operations set.
    pub slow_operation_threshold_ms: u64,
    /// Samples retained per operation.
    pub performance_log_capacity: usize,
    /// Errors retained globally.
    pub error_log_capacity: usize,
    /// Slow operations retained globally.
    pub slow_log_capacity: usize,
    /// Alert when the cache hit rate falls below this.
    pub hit_rate_floor: f64,
    /// Alert when the error rate rises above this.
    pub error_rate_ceiling: f64,
    /// Alert when average response time rises above this.
    pub latency_ceiling_ms: f64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "text".
    pub format: String,
    pub enable_spans: bool,
}

impl Default for RugCacheConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            warming: WarmingConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            command_timeout_ms: 2_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1_000,
            sweep_interval_secs: 60,
            ttl: TtlPolicy::default(),
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            token: TtlPair {
                store_ttl_secs: 1_800,
                memory_ttl_secs: 300,
            },
            static_metadata: TtlPair {
                store_ttl_secs: 86_400,
                memory_ttl_secs: 1_800,
            },
            dynamic_state: TtlPair {
                store_ttl_secs: 300,
                memory_ttl_secs: 60,
            },
            collection_page: TtlPair {
                store_ttl_secs: 600,
                memory_ttl_secs: 60,
            },
            owner_portfolio: TtlPair {
                store_ttl_secs: 3_600,
                memory_ttl_secs: 600,
            },
        }
    }
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            behavior_log_capacity: 100,
            prediction_history_capacity: 20,
            confidence_threshold: 0.3,
            max_predictions: 10,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            slow_operation_threshold_ms: 1_000,
            performance_log_capacity: 1_000,
            error_log_capacity: 500,
            slow_log_capacity: 100,
            hit_rate_floor: 0.5,
            error_rate_ceiling: 0.1,
            latency_ceiling_ms: 1_000.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_spans: true,
        }
    }
}

impl RugCacheConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(&path).map_err(|_| ConfigurationError::FileNotFound {
            path: path.as_ref().to_string_lossy().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigurationError::ParsingFailed {
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self, ConfigurationError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("RUGCACHE_STORE_URL") {
            config.store.url = url;
        }
        if let Ok(timeout) = std::env::var("RUGCACHE_STORE_TIMEOUT_MS") {
            config.store.command_timeout_ms = timeout.parse().unwrap_or(config.store.command_timeout_ms);
        }
        if let Ok(capacity) = std::env::var("RUGCACHE_L1_CAPACITY") {
            config.cache.l1_capacity = capacity.parse().unwrap_or(config.cache.l1_capacity);
        }
        if let Ok(level) = std::env::var("RUGCACHE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(threshold) = std::env::var("RUGCACHE_WARMING_CONFIDENCE") {
            config.warming.confidence_threshold =
                threshold.parse().unwrap_or(config.warming.confidence_threshold);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.store.url.is_empty() {
            return Err(ConfigurationError::MissingRequired {
                key: "store.url".to_string(),
            });
        }
        if self.cache.l1_capacity == 0 {
            return Err(ConfigurationError::InvalidValue {
                key: "cache.l1_capacity".to_string(),
                value: "0".to_string(),
                reason: "L1 capacity must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.warming.confidence_threshold) {
            return Err(ConfigurationError::InvalidValue {
                key: "warming.confidence_threshold".to_string(),
                value: self.warming.confidence_threshold.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.monitoring.hit_rate_floor) {
            return Err(ConfigurationError::InvalidValue {
                key: "monitoring.hit_rate_floor".to_string(),
                value: self.monitoring.hit_rate_floor.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.monitoring.error_rate_ceiling) {
            return Err(ConfigurationError::InvalidValue {
                key: "monitoring.error_rate_ceiling".to_string(),
                value: self.monitoring.error_rate_ceiling.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RugCacheConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = RugCacheConfig::default();
        config.cache.l1_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn collection_pages_have_shortest_store_ttl() {
        let ttl = TtlPolicy::default();
        assert!(ttl.collection_page.store_ttl_secs <= ttl.token.store_ttl_secs);
        assert!(ttl.collection_page.store_ttl_secs <= ttl.static_metadata.store_ttl_secs);
        assert!(ttl.collection_page.store_ttl_secs <= ttl.owner_portfolio.store_ttl_secs);
    }

    #[test]
    fn toml_round_trip() {
        let config = RugCacheConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: RugCacheConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.cache.l1_capacity, config.cache.l1_capacity);
        assert_eq!(
            parsed.cache.ttl.dynamic_state.store_ttl_secs,
            config.cache.ttl.dynamic_state.store_ttl_secs
        );
    }

    #[test]
    fn out_of_range_confidence_rejected() {
        let mut config = RugCacheConfig::default();
        config.warming.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
