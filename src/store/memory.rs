// src/store/memory.rs
//! In-process store. All tables sit behind one mutex, so every operation is
//! linearizable within the process (single-writer discipline).

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use super::{acquire_lock, DedupOutcome, FailureOutcome, SignalStore};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::hamming_distance;
use crate::model::{DecisionRecord, NewSignal, QuotaState, Signal, Subscriber};

const MAX_AUDIT_ROWS: usize = 10_000;

#[derive(Debug, Clone)]
struct DedupRow {
    fingerprint: u64,
    first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    dedup: HashMap<String, DedupRow>,
    quota: BTreeMap<NaiveDate, u32>,
    signals: Vec<Signal>,
    next_signal_id: i64,
    subscribers: BTreeMap<String, Subscriber>,
    decisions: VecDeque<DecisionRecord>,
    leases: HashMap<String, Lease>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn reserve(&mut self, date: NaiveDate, max: u32) -> bool {
        let count = self.quota.entry(date).or_insert(0);
        if *count < max {
            *count += 1;
            true
        } else {
            false
        }
    }

    fn subscriber_mut(&mut self, id: &str) -> StoreResult<&mut Subscriber> {
        self.subscribers
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSubscriber(id.to_string()))
    }
}

impl SignalStore for MemoryStore {
    fn check_and_insert(
        &self,
        url: &str,
        fingerprint: u64,
        hamming_threshold: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<DedupOutcome> {
        let mut t = acquire_lock(&self.tables);
        if t.dedup.contains_key(url) {
            return Ok(DedupOutcome::DuplicateUrl);
        }
        if fingerprint != 0 {
            let nearest = t
                .dedup
                .values()
                .filter(|r| r.fingerprint != 0)
                .map(|r| hamming_distance(r.fingerprint, fingerprint))
                .min();
            if let Some(distance) = nearest.filter(|d| *d <= hamming_threshold) {
                return Ok(DedupOutcome::NearDuplicate { distance });
            }
        }
        t.dedup.insert(
            url.to_string(),
            DedupRow {
                fingerprint,
                first_seen: now,
            },
        );
        Ok(DedupOutcome::New)
    }

    fn purge_dedup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut t = acquire_lock(&self.tables);
        let before = t.dedup.len();
        t.dedup.retain(|_, r| r.first_seen >= cutoff);
        Ok(before - t.dedup.len())
    }

    fn dedup_len(&self) -> StoreResult<usize> {
        Ok(acquire_lock(&self.tables).dedup.len())
    }

    fn quota(&self, date: NaiveDate, max: u32) -> StoreResult<QuotaState> {
        let t = acquire_lock(&self.tables);
        Ok(QuotaState {
            date,
            count: t.quota.get(&date).copied().unwrap_or(0),
            max,
        })
    }

    fn try_reserve(&self, date: NaiveDate, max: u32) -> StoreResult<bool> {
        Ok(acquire_lock(&self.tables).reserve(date, max))
    }

    fn reserve_and_record_signal(
        &self,
        date: NaiveDate,
        max: u32,
        signal: NewSignal,
    ) -> StoreResult<Option<Signal>> {
        let mut t = acquire_lock(&self.tables);
        if !t.reserve(date, max) {
            return Ok(None);
        }
        t.next_signal_id += 1;
        let stored = Signal::from_new(t.next_signal_id, date, signal);
        t.signals.push(stored.clone());
        Ok(Some(stored))
    }

    fn set_recipients(&self, signal_id: i64, recipients: u32) -> StoreResult<()> {
        let mut t = acquire_lock(&self.tables);
        match t.signals.iter_mut().find(|s| s.id == signal_id) {
            Some(s) => {
                s.recipients = recipients;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("unknown signal {signal_id}"))),
        }
    }

    fn signals_on(&self, date: NaiveDate) -> StoreResult<Vec<Signal>> {
        let t = acquire_lock(&self.tables);
        Ok(t.signals.iter().filter(|s| s.date == date).cloned().collect())
    }

    fn activate_subscriber(&self, id: &str) -> StoreResult<()> {
        let mut t = acquire_lock(&self.tables);
        let sub = t
            .subscribers
            .entry(id.to_string())
            .or_insert_with(|| Subscriber {
                id: id.to_string(),
                active: true,
                consecutive_failures: 0,
            });
        sub.active = true;
        sub.consecutive_failures = 0;
        Ok(())
    }

    fn deactivate_subscriber(&self, id: &str) -> StoreResult<()> {
        let mut t = acquire_lock(&self.tables);
        t.subscriber_mut(id)?.active = false;
        Ok(())
    }

    fn subscriber(&self, id: &str) -> StoreResult<Option<Subscriber>> {
        Ok(acquire_lock(&self.tables).subscribers.get(id).cloned())
    }

    fn active_subscribers(&self) -> StoreResult<Vec<Subscriber>> {
        let t = acquire_lock(&self.tables);
        Ok(t.subscribers.values().filter(|s| s.active).cloned().collect())
    }

    fn record_delivery_success(&self, id: &str) -> StoreResult<()> {
        let mut t = acquire_lock(&self.tables);
        t.subscriber_mut(id)?.consecutive_failures = 0;
        Ok(())
    }

    fn record_delivery_failure(&self, id: &str, threshold: u32) -> StoreResult<FailureOutcome> {
        let mut t = acquire_lock(&self.tables);
        let sub = t.subscriber_mut(id)?;
        sub.consecutive_failures = sub.consecutive_failures.saturating_add(1);
        let deactivated = sub.active && sub.consecutive_failures >= threshold;
        if deactivated {
            sub.active = false;
        }
        Ok(FailureOutcome {
            consecutive_failures: sub.consecutive_failures,
            deactivated,
        })
    }

    fn record_decision(&self, record: &DecisionRecord) -> StoreResult<()> {
        let mut t = acquire_lock(&self.tables);
        if t.decisions.len() >= MAX_AUDIT_ROWS {
            t.decisions.pop_front();
        }
        t.decisions.push_back(record.clone());
        Ok(())
    }

    fn recent_decisions(&self, limit: usize) -> StoreResult<Vec<DecisionRecord>> {
        let t = acquire_lock(&self.tables);
        Ok(t.decisions.iter().rev().take(limit).cloned().collect())
    }

    fn purge_archive(
        &self,
        decisions_before: DateTime<Utc>,
        signals_before: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut t = acquire_lock(&self.tables);
        let before = t.decisions.len() + t.signals.len() + t.quota.len();
        t.decisions.retain(|d| d.decided_at >= decisions_before);
        t.signals.retain(|s| s.emitted_at >= signals_before);
        let first_day = signals_before.date_naive();
        t.quota.retain(|day, _| *day >= first_day);
        Ok(before - (t.decisions.len() + t.signals.len() + t.quota.len()))
    }

    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<bool> {
        let mut t = acquire_lock(&self.tables);
        if let Some(existing) = t.leases.get(name) {
            if existing.holder != holder && existing.expires_at > now {
                return Ok(false);
            }
        }
        t.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + chrono::Duration::seconds(ttl_secs),
            },
        );
        Ok(true)
    }

    fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<bool> {
        let mut t = acquire_lock(&self.tables);
        match t.leases.get_mut(name) {
            Some(l) if l.holder == holder => {
                l.expires_at = l.expires_at.max(now + chrono::Duration::seconds(ttl_secs));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()> {
        let mut t = acquire_lock(&self.tables);
        if t.leases.get(name).is_some_and(|l| l.holder == holder) {
            t.leases.remove(name);
        }
        Ok(())
    }
}
