// src/store/mod.rs
//! Persisted state owned by the pipeline: dedup entries, the daily quota
//! ledger, the signal log, subscribers, the decision audit and the run lease.
//!
//! Every check-then-write operation on this trait is a single atomic step in
//! each implementation. Callers never compose a read and a write themselves.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreResult;
use crate::model::{DecisionRecord, NewSignal, QuotaState, Signal, Subscriber};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result of the atomic dedup check-then-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; the entry has been recorded.
    New,
    DuplicateUrl,
    NearDuplicate { distance: u32 },
}

impl DedupOutcome {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupOutcome::New)
    }
}

/// Subscriber state after a failed delivery was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub consecutive_failures: u32,
    pub deactivated: bool,
}

pub trait SignalStore: Send + Sync {
    // --- dedup ---

    /// Duplicate if `url` is already stored or any non-zero stored fingerprint
    /// lies within `hamming_threshold`; otherwise records the entry. Atomic.
    fn check_and_insert(
        &self,
        url: &str,
        fingerprint: u64,
        hamming_threshold: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<DedupOutcome>;

    /// Drop dedup entries first seen before `cutoff`. Returns rows removed.
    fn purge_dedup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    fn dedup_len(&self) -> StoreResult<usize>;

    // --- quota ledger ---

    fn quota(&self, date: NaiveDate, max: u32) -> StoreResult<QuotaState>;

    /// Conditional increment: `count < max` → increment and `true`.
    fn try_reserve(&self, date: NaiveDate, max: u32) -> StoreResult<bool>;

    /// Reserve one slot and persist the signal in the same transaction.
    /// `None` when the quota is exhausted (nothing written).
    fn reserve_and_record_signal(
        &self,
        date: NaiveDate,
        max: u32,
        signal: NewSignal,
    ) -> StoreResult<Option<Signal>>;

    fn set_recipients(&self, signal_id: i64, recipients: u32) -> StoreResult<()>;

    fn signals_on(&self, date: NaiveDate) -> StoreResult<Vec<Signal>>;

    // --- subscribers ---

    /// Subscribe or reactivate; the failure counter is reset.
    fn activate_subscriber(&self, id: &str) -> StoreResult<()>;

    fn deactivate_subscriber(&self, id: &str) -> StoreResult<()>;

    fn subscriber(&self, id: &str) -> StoreResult<Option<Subscriber>>;

    fn active_subscribers(&self) -> StoreResult<Vec<Subscriber>>;

    fn record_delivery_success(&self, id: &str) -> StoreResult<()>;

    /// Count one failure; deactivate when the counter reaches `threshold`.
    fn record_delivery_failure(&self, id: &str, threshold: u32) -> StoreResult<FailureOutcome>;

    // --- audit ---

    fn record_decision(&self, record: &DecisionRecord) -> StoreResult<()>;

    /// Most recent first.
    fn recent_decisions(&self, limit: usize) -> StoreResult<Vec<DecisionRecord>>;

    /// Archive retention: drop decisions older than `decisions_before`, and
    /// signals plus their quota days older than `signals_before`.
    /// Returns rows removed.
    fn purge_archive(
        &self,
        decisions_before: DateTime<Utc>,
        signals_before: DateTime<Utc>,
    ) -> StoreResult<usize>;

    // --- run lease ---

    /// Take the named lease unless another holder owns an unexpired one.
    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<bool>;

    /// Push the expiry out to `now + ttl_secs` (never earlier) if `holder` still owns the
    /// lease. `false` means it was lost (expired and taken over).
    fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<bool>;

    /// Release only if still held by `holder`.
    fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()>;
}

/// Lock a std mutex, recovering the inner value if a previous holder panicked.
pub(crate) fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(target: "store", "store mutex was poisoned, recovering");
            metrics::counter!("store_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        }
    }
}
