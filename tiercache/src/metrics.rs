//! Prometheus metrics for tiercache
//!
//! - Cache operations (get/put/remove/clear) by result
//! - Per-tier operations by status
//! - Maintenance cycles
//! - Per-tier entry gauges

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

lazy_static! {
    /// Cache operations by type and result (hit, miss, stored, rejected, ...)
    pub static ref CACHE_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_operations_total",
        "Total number of cache operations by type and result",
        &["operation", "result"]
    ).unwrap();

    /// Cache operation latency in seconds
    pub static ref CACHE_OP_DURATION: HistogramVec = register_histogram_vec!(
        "tiercache_operation_duration_seconds",
        "Cache operation latency in seconds",
        &["operation"],
        vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();

    /// Tier-level operations by status
    pub static ref CACHE_TIER_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_tier_operations_total",
        "Total number of tier operations by tier, type and status",
        &["tier", "operation", "status"]
    ).unwrap();

    /// Current number of entries per tier
    pub static ref CACHE_TIER_ENTRIES: IntGaugeVec = register_int_gauge_vec!(
        "tiercache_tier_entries",
        "Current number of entries held by each tier",
        &["tier"]
    ).unwrap();

    /// Maintenance cycles and the entries they removed
    pub static ref CACHE_MAINTENANCE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tiercache_maintenance_total",
        "Maintenance activity (cycles run, entries expired, ttl adjustments)",
        &["event"]
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_op(operation: &str, result: &str, duration_secs: f64) {
    CACHE_OPS_TOTAL
        .with_label_values(&[operation, result])
        .inc();
    CACHE_OP_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

pub fn record_tier_op(tier: &str, operation: &str, status: &str) {
    CACHE_TIER_OPS_TOTAL
        .with_label_values(&[tier, operation, status])
        .inc();
}

pub fn set_tier_entries(tier: &str, entries: usize) {
    CACHE_TIER_ENTRIES
        .with_label_values(&[tier])
        .set(entries as i64);
}

pub fn record_maintenance(event: &str, count: u64) {
    CACHE_MAINTENANCE_TOTAL
        .with_label_values(&[event])
        .inc_by(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_op() {
        record_op("get", "hit", 0.0001);

        let metrics = encode().unwrap();
        assert!(metrics.contains("tiercache_operations_total"));
        assert!(metrics.contains("tiercache_operation_duration_seconds"));
    }

    #[test]
    fn test_tier_metrics() {
        record_tier_op("disk", "put", "stored");
        set_tier_entries("disk", 12);

        let metrics = encode().unwrap();
        assert!(metrics.contains("tiercache_tier_operations_total"));
        assert!(metrics.contains("tiercache_tier_entries{tier=\"disk\"} 12"));
    }
}
