// src/lock.rs
//! Processing lock: one pipeline run at a time.
//!
//! Two layers: an in-process `tokio` mutex (`try_lock_owned`, never waits) and
//! a lease row in the store with a TTL, so a second process sees the run too
//! and a crashed holder cannot block forever. While a run is in flight a
//! heartbeat task renews the lease every third of its TTL, so a long run is
//! never mistaken for a crashed one. The returned guard stops the heartbeat
//! and releases both layers on drop, including when the run future is
//! cancelled.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::error::StoreResult;
use crate::fingerprint::short_hash;
use crate::store::SignalStore;

pub const LEASE_NAME: &str = "pipeline_run";

pub struct ProcessingLock {
    local: Arc<Mutex<()>>,
    store: Arc<dyn SignalStore>,
    holder: String,
    lease_secs: i64,
}

/// Held for the whole run.
pub struct RunGuard {
    _local: OwnedMutexGuard<()>,
    store: Arc<dyn SignalStore>,
    holder: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        if let Err(e) = self.store.release_lease(LEASE_NAME, &self.holder) {
            // The lease expires on its own; next run recovers after the TTL.
            tracing::warn!(target: "lock", error = %e, "lease release failed");
        }
    }
}

impl ProcessingLock {
    pub fn new(store: Arc<dyn SignalStore>, lease_secs: i64) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let seed = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            local: Arc::new(Mutex::new(())),
            store,
            holder: format!("pid{}-{}", std::process::id(), short_hash(&seed)),
            lease_secs,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// `Ok(None)` means busy: another run holds the lock.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> StoreResult<Option<RunGuard>> {
        let local = match self.local.clone().try_lock_owned() {
            Ok(g) => g,
            Err(_) => return Ok(None),
        };
        if !self
            .store
            .try_acquire_lease(LEASE_NAME, &self.holder, now, self.lease_secs)?
        {
            return Ok(None);
        }
        Ok(Some(RunGuard {
            _local: local,
            store: self.store.clone(),
            holder: self.holder.clone(),
            heartbeat: self.spawn_heartbeat(),
        }))
    }

    /// Outside a tokio runtime there is nothing to drive the renewals; the
    /// lease then simply runs for its TTL.
    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let store = self.store.clone();
        let holder = self.holder.clone();
        let ttl = self.lease_secs;
        let period = heartbeat_period(ttl);
        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew_lease(LEASE_NAME, &holder, Utc::now(), ttl) {
                    Ok(true) => tracing::trace!(target: "lock", %holder, "lease renewed"),
                    Ok(false) => {
                        counter!("lease_renewals_failed_total").increment(1);
                        tracing::warn!(target: "lock", %holder, "lease lost while run in flight");
                    }
                    Err(e) => {
                        counter!("lease_renewals_failed_total").increment(1);
                        tracing::warn!(target: "lock", error = %e, "lease renewal failed");
                    }
                }
            }
        }))
    }
}

fn heartbeat_period(lease_secs: i64) -> Duration {
    let ms = u64::try_from(lease_secs.max(1)).unwrap_or(1) * 1000 / 3;
    Duration::from_millis(ms.max(100))
}
