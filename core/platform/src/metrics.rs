//! Prometheus metrics for the recommendation lifecycle.
//!
//! Every metric the engine emits is declared in [`names`], so dashboards
//! and alert rules reference a single registry instead of string literals
//! scattered through the call sites.

use crate::errors::PlatformError;
use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;

/// The engine's metric registry.
pub mod names {
    /// Counter: recommendations registered through the engine.
    pub const RECOMMENDATIONS_CREATED: &str = "recommendations_created_total";
    /// Counter: successful patch applies, forward and rollback alike.
    pub const APPLIES: &str = "recommendation_applies_total";
    /// Counter: applies the applier reported as failed.
    pub const APPLY_FAILURES: &str = "recommendation_apply_failures_total";
    /// Counter: applies abandoned at the engine-side deadline.
    pub const APPLY_TIMEOUTS: &str = "recommendation_apply_timeouts_total";
    /// Histogram: wall-clock seconds per applier invocation.
    pub const APPLY_DURATION_SECONDS: &str = "recommendation_apply_duration_seconds";
    /// Counter: terminal rejections.
    pub const REJECTIONS: &str = "recommendation_rejections_total";
    /// Counter: recommendations rolled back, engine path and controller
    /// path alike.
    pub const ROLLBACKS: &str = "recommendation_rollbacks_total";
    /// Counter: recommendations written by the aggregation sweep.
    pub const AGGREGATED_RECOMMENDATIONS: &str = "aggregated_recommendations_total";
    /// Gauge: applied workloads still under outcome observation.
    pub const MONITORED_WORKLOADS: &str = "outcome_monitored_workloads";
}

static EXPORTER_ADDR: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus exporter serving `/metrics` on `bind_addr`.
/// Installing twice is an error naming the address already in use; callers
/// that tolerate a pre-installed exporter can match on the variant.
pub fn init_metrics(bind_addr: SocketAddr) -> Result<(), PlatformError> {
    if let Some(existing) = EXPORTER_ADDR.get() {
        return Err(PlatformError::MetricsExporter {
            addr: bind_addr,
            reason: format!("exporter already listening on {existing}"),
        });
    }

    PrometheusBuilder::new()
        .with_http_listener(bind_addr)
        .install()
        .map_err(|e| PlatformError::MetricsExporter {
            addr: bind_addr,
            reason: e.to_string(),
        })?;

    let _ = EXPORTER_ADDR.set(bind_addr);
    Ok(())
}

/// Count one occurrence. The engine's counters only ever step by one, so
/// the helper takes no amount.
pub fn incr(name: &'static str) {
    counter!(name).increment(1);
}

/// Record one observation, in seconds for duration metrics.
pub fn observe_seconds(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Set a gauge to the current absolute value.
pub fn set_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}
