//! OpenTelemetry instruments for the adapter
//!
//! Covers the three places operators look when a metric goes missing:
//! - declaration validation failures (reconciler)
//! - cache writes and size (cache)
//! - resolution outcomes and fetch latency (query path)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("cloudmetrics"));

// ============================================================================
// Reconciler
// ============================================================================

/// Counter of rejected declarations
///
/// Labels:
/// - `kind`: ExternalMetric, CustomMetric
pub static DECLARATION_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cloudmetrics_declaration_errors_total")
        .with_description("Declarations rejected by validation")
        .with_unit("{declarations}")
        .build()
});

// ============================================================================
// Cache
// ============================================================================

/// Counter of effective cache writes
///
/// Labels:
/// - `op`: upsert, remove
pub static CACHE_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cloudmetrics_cache_writes_total")
        .with_description("Cache writes that changed cache state")
        .with_unit("{writes}")
        .build()
});

/// Gauge of live cache entries
///
/// Labels:
/// - `kind`: external, custom
pub static CACHE_ENTRIES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("cloudmetrics_cache_entries")
        .with_description("Number of live cache entries")
        .with_unit("{entries}")
        .build()
});

// ============================================================================
// Query path
// ============================================================================

/// Counter of query resolutions
///
/// Labels:
/// - `outcome`: found, not_found, ambiguous
pub static RESOLUTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cloudmetrics_resolutions_total")
        .with_description("Metric query resolutions by outcome")
        .with_unit("{resolutions}")
        .build()
});

/// Histogram of cloud fetch duration
///
/// Labels:
/// - `query_type`: azuremonitor, servicebus, appinsights
/// - `result`: success, error
pub static FETCH_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cloudmetrics_fetch_duration_seconds")
        .with_description("Duration of cloud metric fetches in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Label helpers
// ============================================================================

/// Cache write operation label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace
    Upsert,
    /// Delete
    Remove,
}

impl WriteOp {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Remove => "remove",
        }
    }
}

/// Resolution outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Exactly one declaration matched
    Found,
    /// No declaration matched
    NotFound,
    /// More than one declaration matched
    Ambiguous,
}

impl ResolutionOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::NotFound => "not_found",
            Self::Ambiguous => "ambiguous",
        }
    }
}

/// Record one rejected declaration
pub fn record_declaration_error(kind: &'static str) {
    DECLARATION_ERRORS.add(1, &[KeyValue::new("kind", kind)]);
}

/// Record one effective cache write
pub fn record_cache_write(op: WriteOp) {
    CACHE_WRITES.add(1, &[KeyValue::new("op", op.as_str())]);
}

/// Publish current cache sizes
pub fn record_cache_size(external: usize, custom: usize) {
    CACHE_ENTRIES.record(external as u64, &[KeyValue::new("kind", "external")]);
    CACHE_ENTRIES.record(custom as u64, &[KeyValue::new("kind", "custom")]);
}

/// Record a resolution outcome
pub fn record_resolution(outcome: ResolutionOutcome) {
    RESOLUTIONS.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
}

/// Record a fetch and its duration
pub fn record_fetch(query_type: &'static str, success: bool, seconds: f64) {
    let result = if success { "success" } else { "error" };
    FETCH_DURATION.record(
        seconds,
        &[
            KeyValue::new("query_type", query_type),
            KeyValue::new("result", result),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values() {
        assert_eq!(WriteOp::Upsert.as_str(), "upsert");
        assert_eq!(WriteOp::Remove.as_str(), "remove");
        assert_eq!(ResolutionOutcome::NotFound.as_str(), "not_found");
        assert_eq!(ResolutionOutcome::Ambiguous.as_str(), "ambiguous");
    }

    #[test]
    fn recording_without_a_provider_is_a_noop() {
        // the global meter provider is a no-op until telemetry is initialized
        record_declaration_error("ExternalMetric");
        record_cache_write(WriteOp::Upsert);
        record_cache_size(1, 2);
        record_resolution(ResolutionOutcome::Found);
        record_fetch("azuremonitor", true, 0.25);
    }
}
