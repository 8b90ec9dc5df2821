// src/pipeline.rs
//! One pipeline run: lock → fetch → purge → per-record workers → broadcast
//! → ack the sources.
//!
//! Per record: identify → dedup (atomic) → Stage 1 → Stage 2 → decide →
//! reserve quota together with the signal. Accepted signals are persisted
//! before any delivery starts.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::broadcast::{Broadcaster, DeliveryReport, Messenger};
use crate::classifier::{Classifier, ClassifierBackend, SharedBreaker};
use crate::config::PipelineConfig;
use crate::decision::{decide, downgrade_to_quota};
use crate::dedup::Deduplicator;
use crate::error::{PipelineError, StoreError};
use crate::filter::KeywordFilter;
use crate::fingerprint::identify;
use crate::lock::{ProcessingLock, RunGuard};
use crate::metrics::describe_metrics;
use crate::model::{Decision, DecisionKind, DecisionRecord, RawItem, Signal};
use crate::quota::QuotaLedger;
use crate::signal::build_signal;
use crate::source::{ack_all, collect, ItemSource};
use crate::store::{DedupOutcome, SignalStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionCounts {
    pub accept: u32,
    pub duplicate: u32,
    pub filter1: u32,
    pub llm_threshold: u32,
    pub quota: u32,
}

impl DecisionCounts {
    fn bump(&mut self, kind: DecisionKind) {
        match kind {
            DecisionKind::Accept => self.accept += 1,
            DecisionKind::RejectDuplicate => self.duplicate += 1,
            DecisionKind::RejectFilter1 => self.filter1 += 1,
            DecisionKind::RejectLlmThreshold => self.llm_threshold += 1,
            DecisionKind::RejectQuota => self.quota += 1,
        }
    }

    pub fn get(&self, kind: DecisionKind) -> u32 {
        match kind {
            DecisionKind::Accept => self.accept,
            DecisionKind::RejectDuplicate => self.duplicate,
            DecisionKind::RejectFilter1 => self.filter1,
            DecisionKind::RejectLlmThreshold => self.llm_threshold,
            DecisionKind::RejectQuota => self.quota,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub received: usize,
    pub processed: usize,
    pub dropped: usize,
    pub decisions: DecisionCounts,
    pub signals: Vec<Signal>,
    pub deliveries: Vec<DeliveryReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run held the processing lock; nothing was done.
    Skipped,
    Completed(RunReport),
}

struct RecordResult {
    decision: Decision,
    signal: Option<Signal>,
}

struct Inner {
    cfg: PipelineConfig,
    store: Arc<dyn SignalStore>,
    dedup: Deduplicator,
    filter: KeywordFilter,
    classifier: Classifier,
    quota: QuotaLedger,
}

pub struct Pipeline {
    inner: Arc<Inner>,
    lock: ProcessingLock,
    broadcaster: Broadcaster,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        store: Arc<dyn SignalStore>,
        backend: Arc<dyn ClassifierBackend>,
        breaker: SharedBreaker,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self, PipelineError> {
        Self::with_fallbacks(cfg, store, backend, Vec::new(), breaker, messenger)
    }

    /// Like `new`, with fallback models tried in order when `backend` fails.
    pub fn with_fallbacks(
        cfg: PipelineConfig,
        store: Arc<dyn SignalStore>,
        backend: Arc<dyn ClassifierBackend>,
        fallbacks: Vec<Arc<dyn ClassifierBackend>>,
        breaker: SharedBreaker,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self, PipelineError> {
        cfg.validate()?;
        describe_metrics();

        let filter = KeywordFilter::new(cfg.thresholds.filter1, &cfg.keywords, &cfg.guards)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let inner = Inner {
            dedup: Deduplicator::new(store.clone(), cfg.dedup.clone()),
            filter,
            classifier: Classifier::with_fallbacks(
                backend,
                fallbacks,
                breaker,
                cfg.classifier.clone(),
            ),
            quota: QuotaLedger::new(
                store.clone(),
                cfg.limits.max_signals_per_day,
                cfg.timezone.clone(),
            ),
            store: store.clone(),
            cfg,
        };
        Ok(Self {
            lock: ProcessingLock::new(store.clone(), inner.cfg.lock.lease_secs),
            broadcaster: Broadcaster::new(messenger, store, inner.cfg.broadcast.clone()),
            inner: Arc::new(inner),
        })
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.inner.quota
    }

    pub fn lock(&self) -> &ProcessingLock {
        &self.lock
    }

    /// Process already-fetched items. Items over `max_batch` are dropped.
    pub async fn run_once(&self, items: Vec<RawItem>) -> Result<RunOutcome, PipelineError> {
        self.run_once_at(items, Utc::now()).await
    }

    pub async fn run_once_at(
        &self,
        items: Vec<RawItem>,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        let Some(guard) = self.begin(now)? else {
            return Ok(RunOutcome::Skipped);
        };
        self.process(&guard, items, now).await.map(RunOutcome::Completed)
    }

    /// Take the lock first, then fetch at most `max_batch` items. Sources are
    /// acked only after the run completes, while the lock is still held, so a
    /// skipped or aborted run consumes nothing.
    pub async fn run_sources(
        &self,
        sources: &[Arc<dyn ItemSource>],
    ) -> Result<RunOutcome, PipelineError> {
        let now = Utc::now();
        let Some(guard) = self.begin(now)? else {
            return Ok(RunOutcome::Skipped);
        };
        let items = collect(sources, self.inner.cfg.limits.max_batch).await;
        let report = self.process(&guard, items, now).await?;
        ack_all(sources).await;
        drop(guard);
        Ok(RunOutcome::Completed(report))
    }

    fn begin(&self, now: DateTime<Utc>) -> Result<Option<RunGuard>, PipelineError> {
        match self.lock.try_acquire(now)? {
            Some(g) => {
                counter!("pipeline_runs_total").increment(1);
                Ok(Some(g))
            }
            None => {
                counter!("pipeline_runs_skipped_total").increment(1);
                tracing::info!(target: "pipeline", "run skipped: lock busy");
                Ok(None)
            }
        }
    }

    async fn process(
        &self,
        _guard: &RunGuard,
        mut items: Vec<RawItem>,
        now: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        let cfg = &self.inner.cfg;
        let mut report = RunReport {
            received: items.len(),
            ..Default::default()
        };

        self.inner.dedup.purge_expired(now)?;
        self.inner.purge_archive(now)?;

        if items.len() > cfg.limits.max_batch {
            report.dropped = items.len() - cfg.limits.max_batch;
            items.truncate(cfg.limits.max_batch);
            counter!("records_dropped_total").increment(report.dropped as u64);
            tracing::warn!(
                target: "pipeline",
                dropped = report.dropped,
                max_batch = cfg.limits.max_batch,
                "batch over limit, excess dropped"
            );
        }

        let day = self.inner.quota.day_of(now);
        let sem = Arc::new(Semaphore::new(cfg.limits.workers));
        let mut set: JoinSet<Result<RecordResult, StoreError>> = JoinSet::new();
        for raw in items {
            let inner = self.inner.clone();
            let sem = sem.clone();
            set.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| StoreError::Backend(format!("worker pool closed: {e}")))?;
                inner.process_record(raw, day, now).await
            });
        }

        while let Some(joined) = set.join_next().await {
            let res = match joined {
                Ok(r) => r,
                Err(e) => {
                    set.abort_all();
                    return Err(PipelineError::Worker(e.to_string()));
                }
            };
            match res {
                Ok(r) => {
                    report.processed += 1;
                    report.decisions.bump(r.decision.kind);
                    if let Some(s) = r.signal {
                        report.signals.push(s);
                    }
                }
                Err(e) => {
                    set.abort_all();
                    tracing::error!(target: "pipeline", error = %e, "store failure, run aborted");
                    return Err(e.into());
                }
            }
        }

        report.signals.sort_by_key(|s| s.id);
        for signal in &report.signals {
            let d = self.broadcaster.broadcast(signal).await?;
            report.deliveries.push(d);
        }

        gauge!("pipeline_last_run_ts").set(now.timestamp() as f64);
        tracing::info!(
            target: "pipeline",
            received = report.received,
            processed = report.processed,
            accepted = report.decisions.accept,
            duplicates = report.decisions.duplicate,
            filter1 = report.decisions.filter1,
            llm = report.decisions.llm_threshold,
            quota = report.decisions.quota,
            "run finished"
        );
        Ok(report)
    }
}

impl Inner {
    /// Drop audit and signal rows past their retention; 0 days keeps them.
    fn purge_archive(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let r = &self.cfg.retention;
        if r.decisions_days == 0 && r.signals_days == 0 {
            return Ok(());
        }
        let cutoff = |days: i64| match days {
            0 => DateTime::<Utc>::MIN_UTC,
            d => now - Duration::days(d),
        };
        let purged = self
            .store
            .purge_archive(cutoff(r.decisions_days), cutoff(r.signals_days))?;
        if purged > 0 {
            counter!("archive_rows_purged_total").increment(purged as u64);
            tracing::info!(target: "pipeline", purged, "archive rows past retention removed");
        }
        Ok(())
    }

    async fn process_record(
        &self,
        raw: RawItem,
        day: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RecordResult, StoreError> {
        let rec = identify(raw, &self.cfg.dedup);
        let id = rec.log_id();

        let decision = match self.dedup.check(&rec, now)? {
            DedupOutcome::DuplicateUrl => {
                Some(Decision::new(DecisionKind::RejectDuplicate, "same url"))
            }
            DedupOutcome::NearDuplicate { distance } => Some(Decision::new(
                DecisionKind::RejectDuplicate,
                format!("near duplicate (distance {distance})"),
            )),
            DedupOutcome::New => None,
        };

        let mut signal = None;
        let decision = match decision {
            Some(d) => d,
            None => {
                let score = self.filter.score(&rec, now);
                tracing::debug!(
                    target: "pipeline",
                    %id,
                    score = score.score,
                    passed = score.passed,
                    matched = ?score.matched.iter().take(5).collect::<Vec<_>>(),
                    "stage 1"
                );

                let verdict = if score.passed {
                    match self.classifier.classify(&rec).await {
                        Ok(v) => Some(v),
                        Err(e) => {
                            tracing::warn!(target: "pipeline", %id, error = %e, code = e.code(), "classification failed");
                            None
                        }
                    }
                } else {
                    None
                };

                let quota_state = self.quota.state(day)?;
                let d = decide(&score, verdict.as_ref(), &quota_state, &self.cfg.thresholds);
                match (d.is_accept(), verdict.as_ref()) {
                    (true, Some(v)) => {
                        let new = build_signal(&rec, v, now);
                        match self.quota.reserve_with_signal(day, new)? {
                            Some(s) => {
                                signal = Some(s);
                                d
                            }
                            None => downgrade_to_quota(self.quota.max()),
                        }
                    }
                    _ => d,
                }
            }
        };

        counter!("decisions_total", "kind" => decision.kind.as_str()).increment(1);
        tracing::info!(
            target: "pipeline",
            %id,
            decision = decision.kind.as_str(),
            reason = %decision.reason,
            signal_id = signal.as_ref().map(|s| s.id),
            "decision"
        );
        self.store.record_decision(&DecisionRecord {
            normalized_url: rec.normalized_url.clone(),
            kind: decision.kind,
            reason: decision.reason.clone(),
            decided_at: now,
        })?;

        Ok(RecordResult { decision, signal })
    }
}
