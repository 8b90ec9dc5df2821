// tests/common/mod.rs
//
// Shared fakes for the integration tests: scripted classifier backends,
// a recording messenger, a store that can be made to fail, and item builders.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use incident_signals::broadcast::Messenger;
use incident_signals::classifier::ClassifierBackend;
use incident_signals::model::{DecisionRecord, NewSignal, QuotaState, Subscriber};
use incident_signals::store::{DedupOutcome, FailureOutcome};
use incident_signals::{
    ClassifyError, DeliveryError, MemoryStore, PipelineConfig, RawItem, Signal, SignalStore,
    StoreError,
};

pub const GOOD_REPLY: &str = r#"{"relevance":0.9,"urgency":4,"category":"accident","object":"water","why":"main burst, district without water","action":"call"}"#;

pub fn item(url: &str, title: &str, body: &str, now: DateTime<Utc>) -> RawItem {
    RawItem {
        source_id: "city-news".to_string(),
        url: url.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        published_at: Some(now),
        fetched_at: now,
    }
}

/// Six clearly different incident reports; each scores 7 in Stage 1
/// (infrastructure 4 + accident 3).
pub fn incident_batch(now: DateTime<Utc>) -> Vec<RawItem> {
    let texts = [
        ("Pumping station accident in Northbridge", "Residents of twelve streets near the river report no pressure since dawn, engineers inspect valves."),
        ("Boiler house accident leaves Eastfield cold", "Radiators went cold overnight across the old quarter while technicians wait for replacement burners."),
        ("Water main accident floods Market Square", "Shop owners moved goods upstairs after brown water rushed along cobblestones before noon."),
        ("Treatment plant accident at Riverside", "Operators switched chlorination lines manually; downstream villages were warned about turbidity."),
        ("Sewer accident closes Harbor Road", "Traffic police diverted lorries through the container terminal while pumps drained the tunnel."),
        ("Heating main accident near Central Station", "Steam escaped through asphalt cracks and commuters were routed around the fenced crater."),
    ];
    texts
        .iter()
        .enumerate()
        .map(|(i, (title, body))| item(&format!("https://news.example/incident/{i}"), title, body, now))
        .collect()
}

pub fn test_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.classifier.backoff_ms = 1;
    cfg.classifier.timeout_secs = 5;
    cfg.broadcast.per_destination_per_second = 1000;
    cfg.broadcast.global_per_second = 1000;
    cfg.broadcast.max_retry_after_secs = 0;
    cfg
}

/// Returns the same reply to every call and counts calls.
pub struct FixedBackend {
    reply: Result<String, ClassifyError>,
    pub calls: AtomicU32,
}

impl FixedBackend {
    pub fn ok(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(err: ClassifyError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(err),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierBackend for FixedBackend {
    async fn classify_raw(&self, _text: &str, _attempt: u32) -> Result<String, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Plays back replies in order; the last one repeats. Records attempt numbers.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, ClassifyError>>>,
    last: Mutex<Option<Result<String, ClassifyError>>>,
    pub attempts: Mutex<Vec<u32>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, ClassifyError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::from(vec![Ok(reply.to_string())])),
            last: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassifierBackend for ScriptedBackend {
    async fn classify_raw(&self, _text: &str, attempt: u32) -> Result<String, ClassifyError> {
        self.attempts.lock().unwrap().push(attempt);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(r) => {
                *last = Some(r.clone());
                r
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(ClassifyError::Transport("script empty".into()))),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Records every delivered message; destinations can be scripted to fail.
#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: Mutex<Vec<(String, String)>>,
    /// Destination and wall-clock instant of every successful send, in order.
    pub sent_at: Mutex<Vec<(String, Instant)>>,
    scripts: Mutex<HashMap<String, VecDeque<DeliveryError>>>,
    always_fail: Mutex<HashMap<String, DeliveryError>>,
    pub calls: AtomicU32,
}

impl RecordingMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next sends to `dest` with these errors, then succeed.
    pub fn script(&self, dest: &str, errors: Vec<DeliveryError>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(dest.to_string(), errors.into());
    }

    pub fn fail_always(&self, dest: &str, err: DeliveryError) {
        self.always_fail
            .lock()
            .unwrap()
            .insert(dest.to_string(), err);
    }

    pub fn sent_to(&self, dest: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == dest)
            .count()
    }

    pub fn total_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn send_times(&self, dest: &str) -> Vec<Instant> {
        self.sent_at
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == dest)
            .map(|(_, t)| *t)
            .collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, destination: &str, text: &str) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.always_fail.lock().unwrap().get(destination) {
            return Err(e.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(destination)
            .and_then(|q| q.pop_front());
        if let Some(e) = scripted {
            return Err(e);
        }
        self.sent_at
            .lock()
            .unwrap()
            .push((destination.to_string(), Instant::now()));
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), text.to_string()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// MemoryStore wrapper whose dedup/audit writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Backend("disk full".into()))
        } else {
            Ok(())
        }
    }
}

impl SignalStore for FlakyStore {
    fn check_and_insert(
        &self,
        url: &str,
        fingerprint: u64,
        hamming_threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<DedupOutcome, StoreError> {
        self.check()?;
        self.inner
            .check_and_insert(url, fingerprint, hamming_threshold, now)
    }

    fn purge_dedup(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.purge_dedup(cutoff)
    }

    fn dedup_len(&self) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.dedup_len()
    }

    fn quota(&self, date: NaiveDate, max: u32) -> Result<QuotaState, StoreError> {
        self.inner.quota(date, max)
    }

    fn try_reserve(&self, date: NaiveDate, max: u32) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.try_reserve(date, max)
    }

    fn reserve_and_record_signal(
        &self,
        date: NaiveDate,
        max: u32,
        signal: NewSignal,
    ) -> Result<Option<Signal>, StoreError> {
        self.check()?;
        self.inner.reserve_and_record_signal(date, max, signal)
    }

    fn set_recipients(&self, signal_id: i64, recipients: u32) -> Result<(), StoreError> {
        self.inner.set_recipients(signal_id, recipients)
    }

    fn signals_on(&self, date: NaiveDate) -> Result<Vec<Signal>, StoreError> {
        self.inner.signals_on(date)
    }

    fn activate_subscriber(&self, id: &str) -> Result<(), StoreError> {
        self.inner.activate_subscriber(id)
    }

    fn deactivate_subscriber(&self, id: &str) -> Result<(), StoreError> {
        self.inner.deactivate_subscriber(id)
    }

    fn subscriber(&self, id: &str) -> Result<Option<Subscriber>, StoreError> {
        self.inner.subscriber(id)
    }

    fn active_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        self.inner.active_subscribers()
    }

    fn record_delivery_success(&self, id: &str) -> Result<(), StoreError> {
        self.inner.record_delivery_success(id)
    }

    fn record_delivery_failure(
        &self,
        id: &str,
        threshold: u32,
    ) -> Result<FailureOutcome, StoreError> {
        self.inner.record_delivery_failure(id, threshold)
    }

    fn record_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.record_decision(record)
    }

    fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>, StoreError> {
        self.inner.recent_decisions(limit)
    }

    fn purge_archive(
        &self,
        decisions_before: DateTime<Utc>,
        signals_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.inner.purge_archive(decisions_before, signals_before)
    }

    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool, StoreError> {
        self.inner.try_acquire_lease(name, holder, now, ttl_secs)
    }

    fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool, StoreError> {
        self.inner.renew_lease(name, holder, now, ttl_secs)
    }

    fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        self.inner.release_lease(name, holder)
    }
}
