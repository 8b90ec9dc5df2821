// src/model.rs
//! Records that flow through one pipeline pass, plus the persisted
//! rows the core owns (signals, subscribers, decision audit).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Item handed over by the fetch collaborator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// RawItem plus identity: normalized URL, normalized text and a 64-bit simhash.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub raw: RawItem,
    pub normalized_url: String,
    /// Lowercased, markup-stripped, whitespace-collapsed title + body.
    pub normalized_text: String,
    pub fingerprint: u64,
}

impl NormalizedRecord {
    /// Short stable id for logs (never log raw text).
    pub fn log_id(&self) -> String {
        crate::fingerprint::short_hash(&self.normalized_url)
    }
}

/// Stage 1 outcome. `reason` is set when the record was rejected by a guard
/// rather than by the score threshold.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoreResult {
    pub score: i32,
    pub per_category: BTreeMap<String, i32>,
    pub matched: Vec<String>,
    pub passed: bool,
    pub reason: Option<String>,
}

/// Schema-level validity of a classification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Valid,
    Invalid,
}

/// Suggested handling from the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictAction {
    Call,
    Watch,
    Ignore,
}

/// Stage 2 outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    pub relevance: f32,
    pub urgency: u8,
    pub category: String,
    /// "water" | "heat" | "industrial" | "unknown"
    pub object: String,
    pub why: String,
    pub action: VerdictAction,
    pub validity: Validity,
}

impl ClassificationVerdict {
    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }
}

/// Final per-record outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Accept,
    RejectDuplicate,
    RejectFilter1,
    RejectLlmThreshold,
    RejectQuota,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Accept => "ACCEPT",
            DecisionKind::RejectDuplicate => "REJECT_DUPLICATE",
            DecisionKind::RejectFilter1 => "REJECT_FILTER1",
            DecisionKind::RejectLlmThreshold => "REJECT_LLM_THRESHOLD",
            DecisionKind::RejectQuota => "REJECT_QUOTA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACCEPT" => Some(DecisionKind::Accept),
            "REJECT_DUPLICATE" => Some(DecisionKind::RejectDuplicate),
            "REJECT_FILTER1" => Some(DecisionKind::RejectFilter1),
            "REJECT_LLM_THRESHOLD" => Some(DecisionKind::RejectLlmThreshold),
            "REJECT_QUOTA" => Some(DecisionKind::RejectQuota),
            _ => None,
        }
    }
}

/// Decision plus the human-readable reason that goes to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub reason: String,
}

impl Decision {
    pub fn new(kind: DecisionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_accept(&self) -> bool {
        self.kind == DecisionKind::Accept
    }
}

/// Audit row written for every decided record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub normalized_url: String,
    pub kind: DecisionKind,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Quota snapshot for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaState {
    pub date: NaiveDate,
    pub count: u32,
    pub max: u32,
}

impl QuotaState {
    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.count)
    }
}

/// Signal before it is persisted (no id yet).
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub source_id: String,
    pub url: String,
    pub relevance: f32,
    pub urgency: u8,
    pub category: String,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

/// Emitted alert, persisted before broadcast starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub id: i64,
    pub date: NaiveDate,
    pub source_id: String,
    pub url: String,
    pub relevance: f32,
    pub urgency: u8,
    pub category: String,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
    pub recipients: u32,
}

impl Signal {
    pub fn from_new(id: i64, date: NaiveDate, s: NewSignal) -> Self {
        Self {
            id,
            date,
            source_id: s.source_id,
            url: s.url,
            relevance: s.relevance,
            urgency: s.urgency,
            category: s.category,
            message: s.message,
            emitted_at: s.emitted_at,
            recipients: 0,
        }
    }
}

/// Delivery destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscriber {
    pub id: String,
    pub active: bool,
    pub consecutive_failures: u32,
}
