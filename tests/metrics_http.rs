// tests/metrics_http.rs
//
// Global recorder installed after the pipeline is built, the way the binary
// may order things. Own test binary: the recorder can be installed once.

use chrono::Utc;
use std::sync::Arc;

use incident_signals::classifier::shared_breaker;
use incident_signals::metrics::Metrics;
use incident_signals::{MemoryStore, Pipeline, RunOutcome};

mod common;
use common::{incident_batch, test_config, FixedBackend, RecordingMessenger, GOOD_REPLY};

#[tokio::test]
async fn exposition_carries_help_text_after_late_install() {
    let p = Pipeline::new(
        test_config(),
        Arc::new(MemoryStore::new()),
        FixedBackend::ok(GOOD_REPLY),
        shared_breaker(5, 600),
        RecordingMessenger::new(),
    )
    .unwrap();
    let metrics = Metrics::init().expect("first install in this binary");

    let now = Utc::now();
    let out = p.run_once_at(incident_batch(now), now).await.unwrap();
    assert!(matches!(out, RunOutcome::Completed(_)));

    let text = metrics.render();
    assert!(text.contains("# HELP decisions_total Per-record decisions by kind."));
    assert!(text.contains("# HELP pipeline_runs_total"));
    assert!(text.contains("decisions_total{kind=\"ACCEPT\"} 5"));
}
