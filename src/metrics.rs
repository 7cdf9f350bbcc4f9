// src/metrics.rs

//! Defines and registers Prometheus metrics for engine monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire process lifetime.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    /// Number of rolling-update jobs currently running.
    pub static ref JOBS_RUNNING: Gauge =
        register_gauge!("fleet_jobs_running", "Number of rolling-update jobs currently running.").unwrap();
    /// Total jobs that reached a terminal status, labeled by outcome.
    pub static ref JOBS_TOTAL: CounterVec =
        register_counter_vec!("fleet_jobs_total", "Total jobs reaching a terminal status, by outcome.", &["outcome"]).unwrap();
    /// Total hosts that completed the per-host update cycle, labeled by outcome.
    pub static ref HOSTS_TOTAL: CounterVec =
        register_counter_vec!("fleet_hosts_total", "Total hosts processed by the per-host loop, by outcome.", &["outcome"]).unwrap();
    /// Total times a per-host circuit breaker opened.
    pub static ref CIRCUIT_OPENS_TOTAL: Counter =
        register_counter!("fleet_circuit_opens_total", "Total number of times a per-host circuit breaker opened.").unwrap();
    /// Total throttler request attempts that were retried after a transient failure.
    pub static ref THROTTLER_RETRIES_TOTAL: Counter =
        register_counter!("fleet_throttler_retries_total", "Total throttled BMC requests retried after a transient failure.").unwrap();
    /// Total times HA re-enable was attempted.
    pub static ref HA_REENABLE_ATTEMPTS_TOTAL: Counter =
        register_counter!("fleet_ha_reenable_attempts_total", "Total times the engine attempted to re-enable cluster HA.").unwrap();
    /// Total times HA restore failed after being disabled by this engine.
    pub static ref HA_RESTORE_FAILURES_TOTAL: Counter =
        register_counter!("fleet_ha_restore_failures_total", "Total times HA restore failed after this engine disabled it.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Serves `/metrics` on `127.0.0.1:<port>` until the process exits.
pub async fn serve(port: u16) -> std::io::Result<()> {
    use axum::{Router, routing::get};

    let app = Router::new().route("/metrics", get(|| async { gather_metrics() }));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "metrics endpoint listening");
    axum::serve(listener, app).await
}
