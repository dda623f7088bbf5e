//! Prometheus metrics for the reconciler.
//!
//! [`ReconcilerMetrics`] owns a dedicated [`Registry`] that the daemon's
//! `/metrics` endpoint encodes into the Prometheus text exposition format.

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge,
    Opts, Registry, TextEncoder,
};

/// Central collection of all reconciler Prometheus metrics.
pub struct ReconcilerMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Passes started.
    pub passes: IntCounter,
    /// Triggers dropped because a pass was still running.
    pub passes_skipped: IntCounter,
    /// Passes aborted by a pass-level error.
    pub pass_failures: IntCounter,
    /// Transactions returned by the chain source.
    pub transactions_seen: IntCounter,
    /// Payments updated from transaction data.
    pub payments_reconciled: IntCounter,
    /// Payments created for reused addresses.
    pub payments_created: IntCounter,
    /// Payments detached from a reorganized block.
    pub payments_reorged: IntCounter,
    /// Invalid blocks walked past.
    pub invalid_blocks: IntCounter,
    /// Reorg walks that hit the depth limit.
    pub reorg_depth_exceeded: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Unix time the last pass finished.
    pub last_pass_unix: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Wall-clock duration of a pass, in milliseconds.
    pub pass_duration_ms: Histogram,
}

impl ReconcilerMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let passes = register_int_counter_with_registry!(
            Opts::new("tally_passes_total", "Reconciliation passes started"),
            registry
        )
        .expect("failed to register passes counter");

        let passes_skipped = register_int_counter_with_registry!(
            Opts::new(
                "tally_passes_skipped_total",
                "Triggers skipped because a pass was in progress"
            ),
            registry
        )
        .expect("failed to register passes_skipped counter");

        let pass_failures = register_int_counter_with_registry!(
            Opts::new("tally_pass_failures_total", "Reconciliation passes aborted"),
            registry
        )
        .expect("failed to register pass_failures counter");

        let transactions_seen = register_int_counter_with_registry!(
            Opts::new(
                "tally_transactions_seen_total",
                "Transactions listed by the chain source"
            ),
            registry
        )
        .expect("failed to register transactions_seen counter");

        let payments_reconciled = register_int_counter_with_registry!(
            Opts::new(
                "tally_payments_reconciled_total",
                "Payments updated from transaction data"
            ),
            registry
        )
        .expect("failed to register payments_reconciled counter");

        let payments_created = register_int_counter_with_registry!(
            Opts::new(
                "tally_payments_created_total",
                "Payments created for reused addresses"
            ),
            registry
        )
        .expect("failed to register payments_created counter");

        let payments_reorged = register_int_counter_with_registry!(
            Opts::new(
                "tally_payments_reorged_total",
                "Payments detached from reorganized blocks"
            ),
            registry
        )
        .expect("failed to register payments_reorged counter");

        let invalid_blocks = register_int_counter_with_registry!(
            Opts::new("tally_invalid_blocks_total", "Invalid blocks walked past"),
            registry
        )
        .expect("failed to register invalid_blocks counter");

        let reorg_depth_exceeded = register_int_counter_with_registry!(
            Opts::new(
                "tally_reorg_depth_exceeded_total",
                "Reorg walks aborted at the depth limit"
            ),
            registry
        )
        .expect("failed to register reorg_depth_exceeded counter");

        let last_pass_unix = register_int_gauge_with_registry!(
            Opts::new("tally_last_pass_unix", "Unix time of the last finished pass"),
            registry
        )
        .expect("failed to register last_pass_unix gauge");

        // Exponential buckets covering 1 ms → ~16 s.
        let pass_duration_ms = register_histogram_with_registry!(
            HistogramOpts::new("tally_pass_duration_ms", "Pass duration in milliseconds")
                .buckets(prometheus::exponential_buckets(1.0, 2.0, 15).unwrap()),
            registry
        )
        .expect("failed to register pass_duration_ms histogram");

        Self {
            registry,
            passes,
            passes_skipped,
            pass_failures,
            transactions_seen,
            payments_reconciled,
            payments_created,
            payments_reorged,
            invalid_blocks,
            reorg_depth_exceeded,
            last_pass_unix,
            pass_duration_ms,
        }
    }

    /// Encode every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ReconcilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_metrics() {
        let metrics = ReconcilerMetrics::new();
        metrics.passes.inc();
        metrics.pass_duration_ms.observe(12.0);
        let text = metrics.encode();
        assert!(text.contains("tally_passes_total 1"));
        assert!(text.contains("tally_pass_duration_ms_bucket"));
        assert!(text.contains("tally_reorg_depth_exceeded_total 0"));
    }
}
