// src/metrics.rs
//! Prometheus exposition for the pipeline's counters and gauges.

use anyhow::Context;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register descriptions on it.
    /// Fails if one is already installed.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe_metrics();
        Ok(Self { handle })
    }

    /// Recorder that is not installed globally; renders only what is
    /// recorded through it. For tests and embedding.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register HELP text for every series on the current recorder.
///
/// Descriptions go to whichever recorder is installed at call time, so this
/// runs again after `Metrics::init`. Repeating it is harmless.
pub fn describe_metrics() {
    describe_counter!("pipeline_runs_total", "Pipeline runs started.");
    describe_counter!(
        "pipeline_runs_skipped_total",
        "Runs skipped because another run held the lock."
    );
    describe_counter!("decisions_total", "Per-record decisions by kind.");
    describe_counter!(
        "records_dropped_total",
        "Caller-supplied records over the batch limit, dropped."
    );
    describe_counter!(
        "records_deferred_total",
        "Records left at the source by per-run backpressure."
    );
    describe_counter!("archive_rows_purged_total", "Audit and signal rows past retention.");
    describe_counter!("classifier_requests_total", "Classification calls by outcome.");
    describe_counter!("classifier_failures_total", "Classification failures by code.");
    describe_counter!(
        "classifier_fallbacks_total",
        "Hand-overs from a failed model to the next fallback."
    );
    describe_counter!("breaker_transitions_total", "Circuit breaker state changes.");
    describe_counter!("deliveries_total", "Message deliveries by outcome.");
    describe_counter!(
        "subscriber_deactivations_total",
        "Subscribers auto-deactivated."
    );
    describe_counter!("lease_renewals_failed_total", "Run lease heartbeats that lost the lease.");
    describe_gauge!("quota_used_today", "Signals emitted in the current quota day.");
    describe_gauge!("pipeline_last_run_ts", "Unix ts of the last completed run.");
}
