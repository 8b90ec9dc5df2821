// tests/broadcast_deactivation.rs
//
// Fan-out to subscribers: per-destination failure handling and automatic
// deactivation, without one bad destination affecting the others.

use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

use incident_signals::broadcast::Broadcaster;
use incident_signals::model::NewSignal;
use incident_signals::{DeliveryError, MemoryStore, Signal, SignalStore};

mod common;
use common::{test_config, RecordingMessenger};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
}

fn persist_signal(store: &dyn SignalStore, n: usize) -> Signal {
    store
        .reserve_and_record_signal(
            day(),
            100,
            NewSignal {
                source_id: "src".into(),
                url: format!("https://n.example/{n}"),
                relevance: 0.9,
                urgency: 4,
                category: "accident".into(),
                message: format!("SIGNAL | accident | 4/5\nSource: https://n.example/{n}"),
                emitted_at: Utc::now(),
            },
        )
        .unwrap()
        .expect("quota available")
}

fn setup(subs: &[&str]) -> (Arc<MemoryStore>, Arc<RecordingMessenger>, Broadcaster) {
    let store = Arc::new(MemoryStore::new());
    for s in subs {
        store.activate_subscriber(s).unwrap();
    }
    let messenger = RecordingMessenger::new();
    let b = Broadcaster::new(messenger.clone(), store.clone(), test_config().broadcast);
    (store, messenger, b)
}

#[tokio::test]
async fn transient_failures_deactivate_at_threshold() {
    let (store, messenger, b) = setup(&["alice", "bob", "carol"]);
    messenger.fail_always("bob", DeliveryError::Transient("502 bad gateway".into()));

    for n in 0..2 {
        let r = b.broadcast(&persist_signal(store.as_ref(), n)).await.unwrap();
        assert_eq!((r.attempted, r.delivered, r.failed), (3, 2, 1));
        assert!(r.deactivated.is_empty());
    }
    assert_eq!(store.subscriber("bob").unwrap().unwrap().consecutive_failures, 2);

    let r = b.broadcast(&persist_signal(store.as_ref(), 2)).await.unwrap();
    assert_eq!(r.deactivated, vec!["bob".to_string()]);
    assert!(!store.subscriber("bob").unwrap().unwrap().active);

    let r = b.broadcast(&persist_signal(store.as_ref(), 3)).await.unwrap();
    assert_eq!(r.attempted, 2);
    assert_eq!(messenger.sent_to("alice"), 4);
    assert_eq!(messenger.sent_to("carol"), 4);
    assert_eq!(messenger.sent_to("bob"), 0);
}

#[tokio::test]
async fn permanent_failure_deactivates_immediately() {
    let (store, messenger, b) = setup(&["alice", "gone"]);
    messenger.fail_always("gone", DeliveryError::Permanent("bot was blocked by the user".into()));

    let r = b.broadcast(&persist_signal(store.as_ref(), 0)).await.unwrap();
    assert_eq!(r.delivered, 1);
    assert_eq!(r.deactivated, vec!["gone".to_string()]);
    assert_eq!(store.active_subscribers().unwrap().len(), 1);
}

#[tokio::test]
async fn retry_after_is_retried_once() {
    let (store, messenger, b) = setup(&["alice"]);
    messenger.script("alice", vec![DeliveryError::RetryAfter(Duration::from_secs(1))]);

    let r = b.broadcast(&persist_signal(store.as_ref(), 0)).await.unwrap();
    assert_eq!(r.delivered, 1);
    assert_eq!(messenger.sent_to("alice"), 1);
    assert_eq!(messenger.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn success_resets_failure_counter() {
    let (store, messenger, b) = setup(&["alice"]);
    messenger.script(
        "alice",
        vec![
            DeliveryError::Transient("timeout".into()),
            DeliveryError::Transient("timeout".into()),
        ],
    );

    for n in 0..2 {
        b.broadcast(&persist_signal(store.as_ref(), n)).await.unwrap();
    }
    assert_eq!(store.subscriber("alice").unwrap().unwrap().consecutive_failures, 2);

    let r = b.broadcast(&persist_signal(store.as_ref(), 2)).await.unwrap();
    assert_eq!(r.delivered, 1);
    let alice = store.subscriber("alice").unwrap().unwrap();
    assert!(alice.active);
    assert_eq!(alice.consecutive_failures, 0);
}

#[tokio::test]
async fn recipients_are_recorded_on_the_signal() {
    let (store, messenger, b) = setup(&["alice", "bob", "carol"]);
    messenger.fail_always("carol", DeliveryError::Transient("502".into()));

    let s = persist_signal(store.as_ref(), 0);
    b.broadcast(&s).await.unwrap();

    let stored = store.signals_on(day()).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].recipients, 2);
}

#[tokio::test]
async fn reactivation_clears_failures() {
    let (store, messenger, b) = setup(&["bob"]);
    messenger.fail_always("bob", DeliveryError::Permanent("chat not found".into()));
    b.broadcast(&persist_signal(store.as_ref(), 0)).await.unwrap();
    assert!(store.active_subscribers().unwrap().is_empty());

    store.activate_subscriber("bob").unwrap();
    let bob = store.subscriber("bob").unwrap().unwrap();
    assert!(bob.active);
    assert_eq!(bob.consecutive_failures, 0);
}

// Rate caps are enforced by governor on the wall clock, so these run in real
// time with 1/s and 2/s caps.

fn throttled(
    subs: &[&str],
    per_destination: u32,
    global: u32,
) -> (Arc<MemoryStore>, Arc<RecordingMessenger>, Broadcaster) {
    let store = Arc::new(MemoryStore::new());
    for s in subs {
        store.activate_subscriber(s).unwrap();
    }
    let messenger = RecordingMessenger::new();
    let mut cfg = test_config().broadcast;
    cfg.per_destination_per_second = per_destination;
    cfg.global_per_second = global;
    let b = Broadcaster::new(messenger.clone(), store.clone(), cfg);
    (store, messenger, b)
}

#[tokio::test]
async fn per_destination_cap_spaces_sends_without_holding_up_others() {
    let (store, messenger, b) = throttled(&["alice", "bob"], 1, 1000);
    let alice = store.subscriber("alice").unwrap().unwrap();
    let bob = store.subscriber("bob").unwrap().unwrap();

    b.deliver(&persist_signal(store.as_ref(), 0), std::slice::from_ref(&alice))
        .await;
    let started = std::time::Instant::now();
    let r = b
        .deliver(&persist_signal(store.as_ref(), 1), &[alice, bob])
        .await;
    assert_eq!(r.delivered, 2);

    let alice_sends = messenger.send_times("alice");
    let bob_sends = messenger.send_times("bob");
    assert_eq!(alice_sends.len(), 2);
    assert!(
        bob_sends[0].duration_since(started) < Duration::from_millis(300),
        "bob is not queued behind alice"
    );
    assert!(
        alice_sends[1].duration_since(alice_sends[0]) >= Duration::from_millis(900),
        "second send to alice waits for her 1/s budget"
    );
    assert!(alice_sends[1] > bob_sends[0]);
}

#[tokio::test]
async fn global_cap_spreads_a_fan_out() {
    let dests = ["a", "b", "c", "d"];
    let (store, messenger, b) = throttled(&dests, 1000, 2);

    let started = std::time::Instant::now();
    let r = b.broadcast(&persist_signal(store.as_ref(), 0)).await.unwrap();
    assert_eq!(r.delivered, 4);

    let mut times: Vec<_> = dests
        .iter()
        .flat_map(|d| messenger.send_times(d))
        .collect();
    times.sort();
    // Burst of 2, then one every 500ms.
    assert!(times[3].duration_since(started) >= Duration::from_millis(900));
    assert!(started.elapsed() < Duration::from_secs(5));
}
