// src/broadcast/mod.rs
//! Fan-out of a persisted signal to active subscribers.
//!
//! Each destination runs in its own task behind a per-destination token
//! bucket plus a platform-wide bucket (`governor`), so a slow or throttled
//! subscriber never holds up the others. Failure handling per destination:
//! - `Permanent` → deactivated immediately
//! - `RetryAfter` → wait (capped) and retry once
//! - `Transient` → counted; deactivated once the counter reaches the threshold
//!
//! A success resets the counter.

pub mod telegram;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use metrics::counter;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::BroadcastConfig;
use crate::error::{DeliveryError, StoreResult};
use crate::model::{Signal, Subscriber};
use crate::store::SignalStore;

pub use telegram::TelegramMessenger;

/// Delivery platform seam.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, destination: &str, text: &str) -> Result<(), DeliveryError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub signal_id: i64,
    pub attempted: u32,
    pub delivered: u32,
    pub failed: u32,
    pub deactivated: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Delivered,
    Failed { deactivated: bool },
}

pub struct Broadcaster {
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn SignalStore>,
    per_destination: Arc<DefaultKeyedRateLimiter<String>>,
    global: Arc<DefaultDirectRateLimiter>,
    cfg: BroadcastConfig,
}

fn per_second(n: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

impl Broadcaster {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn SignalStore>,
        cfg: BroadcastConfig,
    ) -> Self {
        Self {
            messenger,
            store,
            per_destination: Arc::new(RateLimiter::keyed(per_second(
                cfg.per_destination_per_second,
            ))),
            global: Arc::new(RateLimiter::direct(per_second(cfg.global_per_second))),
            cfg,
        }
    }

    /// Deliver to every active subscriber and record the recipient count.
    pub async fn broadcast(&self, signal: &Signal) -> StoreResult<DeliveryReport> {
        let subs = self.store.active_subscribers()?;
        let report = self.deliver(signal, &subs).await;
        self.store.set_recipients(signal.id, report.delivered)?;
        Ok(report)
    }

    /// Deliver to the given subscribers; inactive ones are skipped.
    pub async fn deliver(&self, signal: &Signal, subscribers: &[Subscriber]) -> DeliveryReport {
        let mut report = DeliveryReport {
            signal_id: signal.id,
            ..Default::default()
        };
        let text: Arc<str> = Arc::from(signal.message.as_str());

        let mut set = JoinSet::new();
        for sub in subscribers.iter().filter(|s| s.active) {
            report.attempted += 1;
            let task = DeliveryTask {
                id: sub.id.clone(),
                text: text.clone(),
                messenger: self.messenger.clone(),
                store: self.store.clone(),
                per_destination: self.per_destination.clone(),
                global: self.global.clone(),
                failure_threshold: self.cfg.failure_threshold,
                max_retry_after: Duration::from_secs(self.cfg.max_retry_after_secs),
            };
            set.spawn(async move {
                let id = task.id.clone();
                (id, task.run().await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Outcome::Delivered)) => report.delivered += 1,
                Ok((id, Outcome::Failed { deactivated })) => {
                    report.failed += 1;
                    if deactivated {
                        report.deactivated.push(id);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(target: "broadcast", error = %e, "delivery task panicked");
                }
            }
        }
        report.deactivated.sort();

        tracing::info!(
            target: "broadcast",
            signal_id = signal.id,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            deactivated = report.deactivated.len(),
            "broadcast finished"
        );
        report
    }
}

struct DeliveryTask {
    id: String,
    text: Arc<str>,
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn SignalStore>,
    per_destination: Arc<DefaultKeyedRateLimiter<String>>,
    global: Arc<DefaultDirectRateLimiter>,
    failure_threshold: u32,
    max_retry_after: Duration,
}

impl DeliveryTask {
    async fn send_once(&self) -> Result<(), DeliveryError> {
        self.per_destination.until_key_ready(&self.id).await;
        self.global.until_ready().await;
        self.messenger.send(&self.id, &self.text).await
    }

    async fn run(self) -> Outcome {
        let mut result = self.send_once().await;
        if let Err(DeliveryError::RetryAfter(wait)) = &result {
            let wait = (*wait).min(self.max_retry_after);
            tracing::debug!(target: "broadcast", dest = %self.id, ?wait, "flood control, retrying once");
            tokio::time::sleep(wait).await;
            result = self.send_once().await;
        }

        match result {
            Ok(()) => {
                counter!("deliveries_total", "outcome" => "sent").increment(1);
                if let Err(e) = self.store.record_delivery_success(&self.id) {
                    tracing::warn!(target: "broadcast", dest = %self.id, error = %e, "failed to reset failure counter");
                }
                Outcome::Delivered
            }
            Err(DeliveryError::Permanent(reason)) => {
                counter!("deliveries_total", "outcome" => "failed").increment(1);
                tracing::warn!(target: "broadcast", dest = %self.id, %reason, "destination gone, deactivating");
                let deactivated = match self.store.deactivate_subscriber(&self.id) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(target: "broadcast", dest = %self.id, error = %e, "deactivation failed");
                        false
                    }
                };
                if deactivated {
                    counter!("subscriber_deactivations_total", "cause" => "permanent").increment(1);
                }
                Outcome::Failed { deactivated }
            }
            Err(e) => {
                counter!("deliveries_total", "outcome" => "failed").increment(1);
                match self
                    .store
                    .record_delivery_failure(&self.id, self.failure_threshold)
                {
                    Ok(f) => {
                        tracing::warn!(
                            target: "broadcast",
                            dest = %self.id,
                            error = %e,
                            consecutive_failures = f.consecutive_failures,
                            deactivated = f.deactivated,
                            "delivery failed"
                        );
                        if f.deactivated {
                            counter!("subscriber_deactivations_total", "cause" => "failures")
                                .increment(1);
                        }
                        Outcome::Failed {
                            deactivated: f.deactivated,
                        }
                    }
                    Err(se) => {
                        tracing::warn!(target: "broadcast", dest = %self.id, error = %se, "failed to record delivery failure");
                        Outcome::Failed { deactivated: false }
                    }
                }
            }
        }
    }
}
