// src/error.rs
//! Error taxonomy.
//!
//! Only `StoreError` is run-fatal. Classification and delivery errors are
//! absorbed by the pipeline (into REJECT_LLM_THRESHOLD decisions and
//! per-subscriber failure counters). Expected outcomes such as duplicates,
//! filter rejections, quota exhaustion and a busy lock are plain values, not
//! errors (see `model::DecisionKind` and `pipeline::RunOutcome`).

use std::time::Duration;

use thiserror::Error;

/// Dedup store / quota ledger failure. Aborts the current run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store backend: {0}")]
    Backend(String),

    #[error("unknown subscriber `{0}`")]
    UnknownSubscriber(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stage 2 failure. Every variant counts against the circuit breaker except
/// `Unavailable`, which is the breaker itself failing fast.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifyError {
    #[error("classification service unavailable (circuit open)")]
    Unavailable,

    #[error("classification request timed out")]
    Timeout,

    #[error("classification service returned HTTP {status}")]
    Http { status: u16 },

    #[error("classification transport error: {0}")]
    Transport(String),

    #[error("classification response invalid: {0}")]
    Invalid(String),
}

impl ClassifyError {
    /// Short code for logs and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            ClassifyError::Unavailable => "circuit_open",
            ClassifyError::Timeout => "timeout",
            ClassifyError::Http { .. } => "http_error",
            ClassifyError::Transport(_) => "transport",
            ClassifyError::Invalid(_) => "invalid",
        }
    }
}

/// Per-destination delivery failure. Never aborts a broadcast.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    /// Destination is gone (blocked the bot, chat deleted). Deactivate now.
    #[error("destination rejected permanently: {0}")]
    Permanent(String),

    /// Platform flood control; retry once after the given delay.
    #[error("rate limited by platform, retry after {0:?}")]
    RetryAfter(Duration),

    #[error("delivery failed: {0}")]
    Transient(String),
}

/// Pipeline-level error surfaced to the scheduler.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}
