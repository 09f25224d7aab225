//! Prometheus metrics for the canary controllers
//!
//! Both binaries expose the same registry: reconcile counts per controller
//! and, in the proxy agent, nginx reload outcomes.

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics registry shared across the binary.
///
/// Clone is cheap (the handle is shared through an Arc).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Reconciliations by controller ("canary" or "proxy") and result
    pub reconciliations_total: IntCounterVec,
    /// Reconciliation duration in seconds, by controller
    pub reconcile_duration_seconds: HistogramVec,
    /// nginx reloads by result (success, error)
    pub nginx_reloads_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "peippo_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "peippo_reconcile_duration_seconds",
                "Duration of one reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let nginx_reloads_total = IntCounterVec::new(
            Opts::new("peippo_nginx_reloads_total", "Total number of nginx reloads"),
            &["result"],
        )?;
        registry.register(Box::new(nginx_reloads_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            nginx_reloads_total,
        })
    }

    pub fn record_reconcile_success(&self, controller: &str) {
        self.reconciliations_total
            .with_label_values(&[controller, "success"])
            .inc();
    }

    pub fn record_reconcile_error(&self, controller: &str) {
        self.reconciliations_total
            .with_label_values(&[controller, "error"])
            .inc();
    }

    pub fn observe_reconcile_duration(&self, controller: &str, seconds: f64) {
        self.reconcile_duration_seconds
            .with_label_values(&[controller])
            .observe(seconds);
    }

    pub fn record_nginx_reload(&self, result: &str) {
        self.nginx_reloads_total.with_label_values(&[result]).inc();
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<ControllerMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
