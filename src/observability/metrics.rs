//! Prometheus metrics for cleanup passes.
//!
//! Provides metrics for:
//! - Cleanup passes by outcome, and their duration
//! - Rows deleted per table
//!
//! Without the `prometheus` feature the recording functions are no-ops.

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Install the Prometheus exporter and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let listen: std::net::SocketAddr = config
        .listen
        .parse()
        .map_err(|e| MetricsError::Setup(format!("Invalid listen address: {e}")))?;

    let builder = PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.duration_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    // Installs the global recorder and spawns the scrape listener
    builder.install().map_err(MetricsError::Install)?;

    tracing::info!(listen = %listen, "Prometheus exporter listening");
    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

/// Convert millisecond buckets to seconds.
#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a finished cleanup pass.
///
/// `outcome` is one of `"success"`, `"error"` or `"not_installed"`.
pub fn record_cleanup_pass(outcome: &'static str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("ttl_cleanup_passes_total", "outcome" => outcome).increment(1);
        histogram!("ttl_cleanup_duration_seconds").record(duration_secs);
    }

    #[cfg(not(feature = "prometheus"))]
    let _ = (outcome, duration_secs);
}

/// Record rows deleted from one table by a committed pass.
pub fn record_rows_deleted(table: &str, rows: u64) {
    #[cfg(feature = "prometheus")]
    {
        if rows > 0 {
            counter!("ttl_rows_deleted_total", "table" => table.to_string()).increment(rows);
        }
    }

    #[cfg(not(feature = "prometheus"))]
    let _ = (table, rows);
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
