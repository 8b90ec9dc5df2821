// src/quota.rs
//! Daily quota ledger. The store performs the conditional increment; this
//! type only fixes the cap and maps instants to calendar days.

use chrono::{DateTime, NaiveDate, Utc};
use metrics::gauge;
use std::sync::Arc;

use crate::config::TimezoneConfig;
use crate::error::StoreResult;
use crate::model::{NewSignal, QuotaState, Signal};
use crate::store::SignalStore;

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn SignalStore>,
    max: u32,
    tz: TimezoneConfig,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn SignalStore>, max: u32, tz: TimezoneConfig) -> Self {
        Self { store, max, tz }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn day_of(&self, now: DateTime<Utc>) -> NaiveDate {
        self.tz.today(now)
    }

    pub fn state(&self, date: NaiveDate) -> StoreResult<QuotaState> {
        self.store.quota(date, self.max)
    }

    /// Take one slot for `date` if any is left.
    pub fn try_reserve(&self, date: NaiveDate) -> StoreResult<bool> {
        let ok = self.store.try_reserve(date, self.max)?;
        self.publish(date);
        Ok(ok)
    }

    /// Take one slot and persist the signal atomically. `None` = exhausted.
    pub fn reserve_with_signal(
        &self,
        date: NaiveDate,
        signal: NewSignal,
    ) -> StoreResult<Option<Signal>> {
        let out = self.store.reserve_and_record_signal(date, self.max, signal)?;
        self.publish(date);
        Ok(out)
    }

    fn publish(&self, date: NaiveDate) {
        if let Ok(q) = self.store.quota(date, self.max) {
            gauge!("quota_used_today").set(f64::from(q.count));
        }
    }
}
