//! Logging configuration and utilities
//!
//! Structured logging for:
//! - Orchestrated business operations
//! - Cache tier lookups and invalidation
//! - Predictive warming
//! - Performance metrics

use tracing::Span;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use std::io;

/// Initialize text-format logging.
pub fn init_logging() -> eyre::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rugcache=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("rugcache logging initialized");
    Ok(())
}

/// Initialize JSON-format logging for aggregated environments.
pub fn init_json_logging() -> eyre::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rugcache=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("rugcache logging initialized with JSON format");
    Ok(())
}

/// Span for one orchestrated business operation.
pub fn operation_span(kind: &str, operation_id: &str) -> Span {
    tracing::info_span!(
        "atomic_operation",
        kind = kind,
        operation_id = %operation_id,
        success = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
        affected = tracing::field::Empty,
    )
}

/// Span for a multi-level cache lookup.
pub fn cache_span(key: &str) -> Span {
    tracing::debug_span!(
        "cache_lookup",
        key = %key,
        source = tracing::field::Empty,
        hit = tracing::field::Empty,
    )
}

/// Span for an invalidation pass.
pub fn invalidation_span(entity: &str, change_kind: &str) -> Span {
    tracing::debug_span!(
        "invalidation",
        entity = %entity,
        change_kind = change_kind,
        keys_invalidated = tracing::field::Empty,
    )
}

/// Guard that logs the elapsed time of an operation when completed.
pub struct PerformanceLogger {
    start: std::time::Instant,
    operation: String,
}

impl PerformanceLogger {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation: operation.into(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn complete(self, success: bool) {
        let elapsed = self.elapsed_ms();
        if success {
            tracing::debug!(operation = %self.operation, duration_ms = elapsed, "operation completed");
        } else {
            tracing::warn!(operation = %self.operation, duration_ms = elapsed, "operation failed");
        }
    }
}
