// tests/circuit_breaker.rs
//
// Classifier failure policy: retries on invalid replies, model fallbacks,
// breaker trips after consecutive failures, fails fast while open, admits a
// single trial after the cooldown.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use incident_signals::classifier::{shared_breaker, BreakerState, Classifier};
use incident_signals::config::{ClassifierConfig, DedupConfig};
use incident_signals::fingerprint::identify;
use incident_signals::model::NormalizedRecord;
use incident_signals::ClassifyError;

mod common;
use common::{item, FixedBackend, ScriptedBackend, GOOD_REPLY};

fn record() -> NormalizedRecord {
    let now = Utc::now();
    identify(
        item(
            "https://n.example/boiler",
            "Boiler house accident",
            "Radiators went cold after the boiler house accident.",
            now,
        ),
        &DedupConfig::default(),
    )
}

fn fast_cfg() -> ClassifierConfig {
    ClassifierConfig {
        backoff_ms: 1,
        timeout_secs: 1,
        ..ClassifierConfig::default()
    }
}

#[tokio::test]
async fn invalid_replies_are_retried_then_succeed() {
    let backend = ScriptedBackend::new(vec![
        Ok("sorry, I cannot help".into()),
        Ok(r#"{"relevance": "high"}"#.into()),
        Ok(GOOD_REPLY.into()),
    ]);
    let c = Classifier::new(backend.clone(), shared_breaker(5, 600), fast_cfg());

    let v = c.classify(&record()).await.expect("third attempt is valid");
    assert_eq!(v.urgency, 4);
    assert_eq!(backend.attempts(), vec![0, 1, 2]);
    assert_eq!(c.breaker_snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn empty_completion_from_backend_is_retried() {
    let backend = ScriptedBackend::new(vec![
        Err(ClassifyError::Invalid("empty completion".into())),
        Ok(GOOD_REPLY.into()),
    ]);
    let c = Classifier::new(backend.clone(), shared_breaker(5, 600), fast_cfg());

    let v = c.classify(&record()).await.expect("retry after empty completion");
    assert!(v.is_valid());
    assert_eq!(backend.attempts(), vec![0, 1]);
    assert_eq!(c.breaker_snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn retries_are_bounded_and_count_once() {
    let backend = ScriptedBackend::new(vec![Ok("not json".into())]);
    let c = Classifier::new(backend.clone(), shared_breaker(5, 600), fast_cfg());

    let err = c.classify(&record()).await.unwrap_err();
    assert!(matches!(err, ClassifyError::Invalid(_)));
    assert_eq!(backend.attempts().len(), 3, "first try + 2 retries");
    assert_eq!(c.breaker_snapshot().consecutive_failures, 1);
}

#[tokio::test]
async fn http_errors_are_not_retried() {
    let backend = ScriptedBackend::new(vec![Err(ClassifyError::Http { status: 502 })]);
    let c = Classifier::new(backend.clone(), shared_breaker(5, 600), fast_cfg());

    let err = c.classify(&record()).await.unwrap_err();
    assert_eq!(err, ClassifyError::Http { status: 502 });
    assert_eq!(backend.attempts(), vec![0]);
}

#[tokio::test]
async fn fallback_model_answers_when_primary_fails() {
    let primary = FixedBackend::failing(ClassifyError::Http { status: 429 });
    let fallback = ScriptedBackend::new(vec![Ok(GOOD_REPLY.into())]);
    let c = Classifier::with_fallbacks(
        primary.clone(),
        vec![fallback.clone()],
        shared_breaker(5, 600),
        fast_cfg(),
    );

    let v = c.classify(&record()).await.expect("fallback answers");
    assert_eq!(v.category, "accident");
    assert_eq!(primary.calls(), 1);
    assert_eq!(fallback.attempts(), vec![0]);
    assert_eq!(c.breaker_snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn exhausted_fallback_chain_counts_one_failure() {
    let primary = FixedBackend::failing(ClassifyError::Http { status: 503 });
    let second = ScriptedBackend::new(vec![Ok("not json".into())]);
    let third = FixedBackend::failing(ClassifyError::Transport("connection reset".into()));
    let c = Classifier::with_fallbacks(
        primary.clone(),
        vec![second.clone(), third.clone()],
        shared_breaker(5, 600),
        fast_cfg(),
    );

    let err = c.classify(&record()).await.unwrap_err();
    assert_eq!(err, ClassifyError::Transport("connection reset".into()));
    assert_eq!(primary.calls(), 1);
    assert_eq!(second.attempts().len(), 3, "invalid replies retried on each model");
    assert_eq!(third.calls(), 1);
    assert_eq!(c.breaker_snapshot().consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out() {
    let backend = ScriptedBackend::slow(GOOD_REPLY, Duration::from_secs(30));
    let c = Classifier::new(backend, shared_breaker(5, 600), fast_cfg());

    let err = c.classify(&record()).await.unwrap_err();
    assert_eq!(err, ClassifyError::Timeout);
    assert_eq!(err.code(), "timeout");
}

#[tokio::test]
async fn open_breaker_fails_fast_without_calling_backend() {
    let backend = FixedBackend::failing(ClassifyError::Http { status: 500 });
    let c = Classifier::new(backend.clone(), shared_breaker(3, 600), fast_cfg());
    let rec = record();
    let t0 = Utc::now();

    for _ in 0..3 {
        assert!(c.classify_at(&rec, t0).await.is_err());
    }
    assert_eq!(c.breaker_snapshot().state, BreakerState::Open);
    assert_eq!(backend.calls(), 3);

    let during = t0 + ChronoDuration::seconds(300);
    for _ in 0..5 {
        assert_eq!(
            c.classify_at(&rec, during).await.unwrap_err(),
            ClassifyError::Unavailable
        );
    }
    assert_eq!(backend.calls(), 3, "no calls while open");

    // After the cooldown one trial goes out; it fails and re-opens.
    let after = t0 + ChronoDuration::seconds(601);
    assert_eq!(
        c.classify_at(&rec, after).await.unwrap_err(),
        ClassifyError::Http { status: 500 }
    );
    assert_eq!(backend.calls(), 4);
    assert_eq!(c.breaker_snapshot().state, BreakerState::Open);
}

#[tokio::test]
async fn half_open_admits_exactly_one_trial() {
    let breaker = shared_breaker(1, 600);
    let t0 = Utc::now();
    breaker.lock().unwrap().on_failure(t0);
    assert_eq!(breaker.lock().unwrap().state(), BreakerState::Open);

    let backend = ScriptedBackend::slow(GOOD_REPLY, Duration::from_millis(50));
    let c = Classifier::new(backend.clone(), breaker.clone(), fast_cfg());
    let rec = record();
    let after = t0 + ChronoDuration::seconds(601);

    let (first, second) = tokio::join!(c.classify_at(&rec, after), c.classify_at(&rec, after));
    assert!(first.is_ok());
    assert_eq!(second.unwrap_err(), ClassifyError::Unavailable);
    assert_eq!(backend.attempts().len(), 1);
    assert_eq!(breaker.lock().unwrap().state(), BreakerState::Closed);
}

#[tokio::test]
async fn cancelled_trial_frees_the_slot() {
    let breaker = shared_breaker(1, 600);
    let t0 = Utc::now();
    breaker.lock().unwrap().on_failure(t0);

    let backend = ScriptedBackend::slow(GOOD_REPLY, Duration::from_secs(3));
    let c = Classifier::new(backend.clone(), breaker.clone(), fast_cfg());
    let rec = record();
    let after = t0 + ChronoDuration::seconds(601);

    // Dropped mid-flight: the trial never reports back.
    let _ = tokio::time::timeout(Duration::from_millis(20), c.classify_at(&rec, after)).await;
    assert_eq!(breaker.lock().unwrap().state(), BreakerState::HalfOpen);

    let admission = breaker.lock().unwrap().admit(after);
    assert_eq!(admission, incident_signals::classifier::Admission::Trial);
}
