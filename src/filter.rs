// src/filter.rs
//! Stage 1: local keyword scoring plus cheap guards.
//!
//! Score = Σ over categories of (positive matches − negative matches) × weight.
//! Keywords and guard phrases are matched as whole words/phrases against the
//! normalized (lowercased) text. Stage 1 never fails at runtime.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::BTreeMap;

use crate::config::{ComboConfig, GuardsConfig, KeywordsConfig};
use crate::model::{NormalizedRecord, ScoreResult};

pub const REASON_STALE: &str = "STALE_NEWS";
pub const REASON_RESOLVED: &str = "RESOLVED_EVENT";
pub const REASON_NOISE: &str = "NOISE_HARD_TOPIC";
pub const REASON_COMBO: &str = "COMBO_RULE_FAILED";

const RESOLVED_SCAN_CHARS: usize = 1500;
const NOISE_SCAN_CHARS: usize = 1000;

/// Compiled list of whole-word phrases.
#[derive(Debug, Default)]
struct PhraseSet {
    items: Vec<(String, Regex)>,
}

impl PhraseSet {
    fn compile(phrases: &[String]) -> Result<Self> {
        let items = phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .map(|p| {
                let re = Regex::new(&format!(r"\b{}\b", regex::escape(&p)))
                    .map_err(|e| anyhow!("keyword `{p}` regex error: {e}"))?;
                Ok((p, re))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { items })
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn matches<'a>(&'a self, text: &str) -> Vec<&'a str> {
        self.items
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(p, _)| p.as_str())
            .collect()
    }

    fn any(&self, text: &str) -> bool {
        self.items.iter().any(|(_, re)| re.is_match(text))
    }
}

#[derive(Debug)]
struct CompiledCategory {
    name: String,
    weight: i32,
    positive: PhraseSet,
    negative: PhraseSet,
}

#[derive(Debug)]
struct Combo {
    event_categories: Vec<String>,
    object_categories: Vec<String>,
    strong_override: PhraseSet,
}

#[derive(Debug)]
pub struct KeywordFilter {
    threshold: i32,
    categories: Vec<CompiledCategory>,
    max_age_days: i64,
    resolved: PhraseSet,
    ongoing: PhraseSet,
    noise: PhraseSet,
    noise_exceptions: PhraseSet,
    combo: Option<Combo>,
}

fn prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl KeywordFilter {
    pub fn new(threshold: i32, keywords: &KeywordsConfig, guards: &GuardsConfig) -> Result<Self> {
        let categories = keywords
            .categories
            .iter()
            .map(|c| {
                Ok(CompiledCategory {
                    name: c.name.clone(),
                    weight: c.weight,
                    positive: PhraseSet::compile(&c.positive)?,
                    negative: PhraseSet::compile(&c.negative)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            threshold,
            categories,
            max_age_days: guards.max_age_days,
            resolved: PhraseSet::compile(&guards.resolved_phrases)?,
            ongoing: PhraseSet::compile(&guards.ongoing_phrases)?,
            noise: PhraseSet::compile(&guards.noise_terms)?,
            noise_exceptions: PhraseSet::compile(&guards.noise_exceptions)?,
            combo: Self::compile_combo(&guards.combo)?,
        })
    }

    fn compile_combo(c: &ComboConfig) -> Result<Option<Combo>> {
        if !c.enabled || c.event_categories.is_empty() || c.object_categories.is_empty() {
            return Ok(None);
        }
        Ok(Some(Combo {
            event_categories: c.event_categories.clone(),
            object_categories: c.object_categories.clone(),
            strong_override: PhraseSet::compile(&c.strong_override_phrases)?,
        }))
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// Weighted keyword score of already-normalized text, without guards.
    pub fn score_text(&self, text: &str) -> ScoreResult {
        let mut per_category = BTreeMap::new();
        let mut matched = Vec::new();
        let mut total = 0i32;

        for cat in &self.categories {
            let pos = cat.positive.matches(text);
            let neg = cat.negative.matches(text);
            if pos.is_empty() && neg.is_empty() {
                continue;
            }
            let net = pos.len() as i32 - neg.len() as i32;
            let weighted = net.saturating_mul(cat.weight);
            total = total.saturating_add(weighted);
            per_category.insert(cat.name.clone(), weighted);
            matched.extend(pos.iter().map(|p| p.to_string()));
            matched.extend(neg.iter().map(|n| format!("-{n}")));
        }

        ScoreResult {
            score: total,
            per_category,
            matched,
            passed: total >= self.threshold,
            reason: None,
        }
    }

    /// Full Stage 1: score, then guards. A guard rejection sets `reason`.
    pub fn score(&self, rec: &NormalizedRecord, now: DateTime<Utc>) -> ScoreResult {
        let text = rec.normalized_text.as_str();
        let mut res = self.score_text(text);

        let reject = |mut r: ScoreResult, reason: &str| {
            r.passed = false;
            r.reason = Some(reason.to_string());
            r
        };

        if self.is_stale(rec, now) {
            return reject(res, REASON_STALE);
        }
        if self.is_resolved(text) {
            return reject(res, REASON_RESOLVED);
        }
        if self.is_noise(text) {
            return reject(res, REASON_NOISE);
        }
        if res.passed && !self.combo_satisfied(&res, text) {
            return reject(res, REASON_COMBO);
        }

        res.reason = None;
        res
    }

    fn is_stale(&self, rec: &NormalizedRecord, now: DateTime<Utc>) -> bool {
        if self.max_age_days <= 0 {
            return false;
        }
        let at = rec.raw.published_at.unwrap_or(rec.raw.fetched_at);
        now - at > Duration::days(self.max_age_days)
    }

    fn is_resolved(&self, text: &str) -> bool {
        if self.resolved.is_empty() {
            return false;
        }
        let head = prefix(text, RESOLVED_SCAN_CHARS);
        self.resolved.any(head) && !self.ongoing.any(head)
    }

    fn is_noise(&self, text: &str) -> bool {
        if self.noise.is_empty() {
            return false;
        }
        self.noise.any(prefix(text, NOISE_SCAN_CHARS)) && !self.noise_exceptions.any(text)
    }

    fn combo_satisfied(&self, res: &ScoreResult, text: &str) -> bool {
        let Some(combo) = &self.combo else {
            return true;
        };
        let positive = |names: &[String]| {
            names
                .iter()
                .any(|n| res.per_category.get(n).is_some_and(|s| *s > 0))
        };
        if positive(&combo.event_categories) && positive(&combo.object_categories) {
            return true;
        }
        let overrides = combo.strong_override.matches(text);
        if let Some(phrase) = overrides.first() {
            tracing::debug!(target: "filter", phrase, "combo bypassed by strong phrase");
            return true;
        }
        false
    }
}
