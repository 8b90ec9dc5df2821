// src/classifier/mod.rs
//! Stage 2: external classification behind a circuit breaker.
//!
//! `ClassifierBackend` is the transport seam (HTTP in production, scripted
//! fakes in tests). `Classifier` owns the failure policy:
//! - breaker OPEN → `ClassifyError::Unavailable`, backend not called
//! - each attempt runs under a timeout
//! - an empty or schema-invalid reply is retried with exponential backoff
//! - timeout / HTTP / transport errors are not retried on the same model
//! - a failed model hands over to the next configured fallback
//! - one overall failure counts once against the breaker

pub mod breaker;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ClassifierConfig;
use crate::error::ClassifyError;
use crate::model::{ClassificationVerdict, NormalizedRecord, Validity, VerdictAction};
use crate::store::acquire_lock;

pub use breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use http::HttpBackend;

/// Objects the classifier may name; anything else is stored as "unknown".
pub const OBJECTS: [&str; 4] = ["water", "heat", "industrial", "unknown"];

const MAX_WHY_CHARS: usize = 300;

/// Raw transport: send text, get the service's reply body (expected JSON).
///
/// `attempt` is 0 for the first try; backends may tighten the prompt on retries.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    async fn classify_raw(&self, text: &str, attempt: u32) -> Result<String, ClassifyError>;

    fn name(&self) -> &'static str;
}

/// Breaker shared by every classification call in the process.
pub type SharedBreaker = Arc<Mutex<CircuitBreaker>>;

pub fn shared_breaker(failure_threshold: u32, cooldown_secs: i64) -> SharedBreaker {
    Arc::new(Mutex::new(CircuitBreaker::new(failure_threshold, cooldown_secs)))
}

pub struct Classifier {
    /// Primary first, then fallbacks in order. Never empty.
    backends: Vec<Arc<dyn ClassifierBackend>>,
    breaker: SharedBreaker,
    cfg: ClassifierConfig,
}

/// Clears a half-open trial slot if the call is dropped before it reports.
struct TrialGuard<'a> {
    breaker: &'a SharedBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            acquire_lock(self.breaker).release_trial();
        }
    }
}

impl Classifier {
    pub fn new(
        backend: Arc<dyn ClassifierBackend>,
        breaker: SharedBreaker,
        cfg: ClassifierConfig,
    ) -> Self {
        Self::with_fallbacks(backend, Vec::new(), breaker, cfg)
    }

    pub fn with_fallbacks(
        primary: Arc<dyn ClassifierBackend>,
        fallbacks: Vec<Arc<dyn ClassifierBackend>>,
        breaker: SharedBreaker,
        cfg: ClassifierConfig,
    ) -> Self {
        let mut backends = Vec::with_capacity(1 + fallbacks.len());
        backends.push(primary);
        backends.extend(fallbacks);
        Self {
            backends,
            breaker,
            cfg,
        }
    }

    pub fn breaker(&self) -> SharedBreaker {
        self.breaker.clone()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        acquire_lock(&self.breaker).snapshot()
    }

    pub async fn classify(
        &self,
        rec: &NormalizedRecord,
    ) -> Result<ClassificationVerdict, ClassifyError> {
        self.classify_at(rec, Utc::now()).await
    }

    /// Classify with an explicit admission time (breaker clock).
    pub async fn classify_at(
        &self,
        rec: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<ClassificationVerdict, ClassifyError> {
        let admission = acquire_lock(&self.breaker).admit(now);
        if admission == Admission::Rejected {
            counter!("classifier_requests_total", "outcome" => "circuit_open").increment(1);
            return Err(ClassifyError::Unavailable);
        }
        let mut trial = TrialGuard {
            breaker: &self.breaker,
            armed: admission == Admission::Trial,
        };

        let text = self.request_text(rec);
        let result = self.run_chain(&text, &rec.log_id()).await;

        trial.armed = false;
        let finished_at = Utc::now().max(now);
        let (before, after) = {
            let mut b = acquire_lock(&self.breaker);
            let before = b.state();
            match &result {
                Ok(_) => b.on_success(),
                Err(_) => b.on_failure(finished_at),
            }
            (before, b.state())
        };
        if before != after {
            counter!("breaker_transitions_total", "to" => after.as_str()).increment(1);
            tracing::warn!(
                target: "classifier",
                from = before.as_str(),
                to = after.as_str(),
                "circuit breaker transition"
            );
        }

        match &result {
            Ok(_) => counter!("classifier_requests_total", "outcome" => "ok").increment(1),
            Err(e) => {
                counter!("classifier_requests_total", "outcome" => "error").increment(1);
                counter!("classifier_failures_total", "code" => e.code()).increment(1);
            }
        }
        result
    }

    async fn run_chain(&self, text: &str, id: &str) -> Result<ClassificationVerdict, ClassifyError> {
        let mut last = ClassifyError::Unavailable;
        for (idx, backend) in self.backends.iter().enumerate() {
            match self.attempt_with_retries(backend.as_ref(), text, id).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if idx + 1 < self.backends.len() {
                        counter!("classifier_fallbacks_total", "code" => e.code()).increment(1);
                        tracing::warn!(
                            target: "classifier",
                            %id,
                            backend = backend.name(),
                            model_index = idx,
                            error = %e,
                            "model failed, trying fallback"
                        );
                    }
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn attempt_with_retries(
        &self,
        backend: &dyn ClassifierBackend,
        text: &str,
        id: &str,
    ) -> Result<ClassificationVerdict, ClassifyError> {
        let timeout = Duration::from_secs(self.cfg.timeout_secs.max(1));
        let mut attempt: u32 = 0;
        loop {
            let problem = match tokio::time::timeout(timeout, backend.classify_raw(text, attempt)).await {
                Err(_) => return Err(ClassifyError::Timeout),
                Ok(Err(ClassifyError::Invalid(msg))) => msg,
                Ok(Err(e)) => return Err(e),
                Ok(Ok(reply)) => match parse_verdict(&reply, &self.cfg.categories) {
                    Ok(v) if v.is_valid() => return Ok(v),
                    Ok(v) => format!("out of range: relevance={} urgency={}", v.relevance, v.urgency),
                    Err(ClassifyError::Invalid(msg)) => msg,
                    Err(e) => return Err(e),
                },
            };

            if attempt >= self.cfg.retries {
                return Err(ClassifyError::Invalid(problem));
            }
            attempt += 1;
            tracing::debug!(target: "classifier", %id, attempt, %problem, "invalid reply, retrying");
            let backoff = self
                .cfg
                .backoff_ms
                .saturating_mul(1u64 << (attempt - 1).min(16));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    fn request_text(&self, rec: &NormalizedRecord) -> String {
        rec.normalized_text
            .chars()
            .take(self.cfg.max_input_chars)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct WireVerdict {
    relevance: f64,
    urgency: f64,
    category: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    why: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

/// Pull the outermost JSON object out of a reply (tolerates code fences / prose).
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

/// Parse and validate a service reply.
///
/// Unparseable replies and unknown categories/actions are `Err(Invalid)`.
/// Parseable replies with out-of-range scores come back flagged
/// `Validity::Invalid`.
pub fn parse_verdict(
    raw: &str,
    categories: &[String],
) -> Result<ClassificationVerdict, ClassifyError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ClassifyError::Invalid("no JSON object in reply".into()))?;
    let w: WireVerdict = serde_json::from_str(json)
        .map_err(|e| ClassifyError::Invalid(format!("schema: {e}")))?;

    let category = w.category.trim().to_lowercase();
    if !categories.iter().any(|c| c.eq_ignore_ascii_case(&category)) {
        return Err(ClassifyError::Invalid(format!("unknown category `{category}`")));
    }

    let action = match w.action.as_deref().map(|a| a.trim().to_lowercase()) {
        None => VerdictAction::Watch,
        Some(a) if a == "call" => VerdictAction::Call,
        Some(a) if a == "watch" => VerdictAction::Watch,
        Some(a) if a == "ignore" => VerdictAction::Ignore,
        Some(a) => return Err(ClassifyError::Invalid(format!("unknown action `{a}`"))),
    };

    let object = w
        .object
        .map(|o| o.trim().to_lowercase())
        .filter(|o| OBJECTS.contains(&o.as_str()))
        .unwrap_or_else(|| "unknown".to_string());

    let why: String = w
        .why
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_WHY_CHARS)
        .collect();

    let relevance_ok = w.relevance.is_finite() && (0.0..=1.0).contains(&w.relevance);
    let urgency_ok = w.urgency.fract() == 0.0 && (1.0..=5.0).contains(&w.urgency);
    let validity = if relevance_ok && urgency_ok {
        Validity::Valid
    } else {
        Validity::Invalid
    };

    Ok(ClassificationVerdict {
        relevance: w.relevance.clamp(0.0, 1.0) as f32,
        urgency: w.urgency.clamp(0.0, 255.0) as u8,
        category,
        object,
        why,
        action,
        validity,
    })
}
