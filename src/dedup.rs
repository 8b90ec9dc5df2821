// src/dedup.rs
//! Duplicate detection over the store: exact normalized URL or a fingerprint
//! within the Hamming threshold. The check and the insert are one store call.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::sync::Arc;

use crate::config::DedupConfig;
use crate::error::StoreResult;
use crate::model::NormalizedRecord;
use crate::store::{DedupOutcome, SignalStore};

pub struct Deduplicator {
    store: Arc<dyn SignalStore>,
    cfg: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn SignalStore>, cfg: DedupConfig) -> Self {
        Self { store, cfg }
    }

    /// Check the record and, if new, record it as seen.
    pub fn check(&self, rec: &NormalizedRecord, now: DateTime<Utc>) -> StoreResult<DedupOutcome> {
        let out = self.store.check_and_insert(
            &rec.normalized_url,
            rec.fingerprint,
            self.cfg.hamming_threshold,
            now,
        )?;
        match out {
            DedupOutcome::New => {}
            DedupOutcome::DuplicateUrl => {
                counter!("dedup_hits_total", "kind" => "url").increment(1);
            }
            DedupOutcome::NearDuplicate { distance } => {
                counter!("dedup_hits_total", "kind" => "fingerprint").increment(1);
                tracing::debug!(target: "dedup", id = %rec.log_id(), distance, "near duplicate");
            }
        }
        Ok(out)
    }

    pub fn is_duplicate(&self, rec: &NormalizedRecord, now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self.check(rec, now)?.is_duplicate())
    }

    /// Drop entries outside the retention window. Returns rows removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = now - Duration::hours(self.cfg.retention_hours.max(0));
        let n = self.store.purge_dedup(cutoff)?;
        if n > 0 {
            tracing::info!(target: "dedup", purged = n, "dedup entries expired");
        }
        Ok(n)
    }
}
