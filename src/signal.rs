// src/signal.rs
//! Plain-text alert message and the `NewSignal` built from an accepted record.

use chrono::{DateTime, Utc};

use crate::model::{ClassificationVerdict, NewSignal, NormalizedRecord};

pub const MAX_SUMMARY_CHARS: usize = 200;
pub const MAX_WHY_CHARS: usize = 300;

/// Sphere shown to subscribers, derived from the classifier's `object`.
pub fn sphere(object: &str) -> &'static str {
    match object {
        "industrial" => "industry",
        _ => "utilities",
    }
}

/// Collapse whitespace and cap at `max` chars (ellipsis included).
pub fn truncate_field(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max {
        return collapsed;
    }
    let keep = max.saturating_sub(3);
    let mut out: String = collapsed.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Five fixed lines, no markup.
pub fn format_message(title: &str, url: &str, verdict: &ClassificationVerdict) -> String {
    format!(
        "SIGNAL | {} | {}/5\nSphere: {}\nSummary: {}\nWhy: {}\nSource: {}",
        verdict.category,
        verdict.urgency,
        sphere(&verdict.object),
        truncate_field(title, MAX_SUMMARY_CHARS),
        truncate_field(&verdict.why, MAX_WHY_CHARS),
        url
    )
}

pub fn build_signal(
    rec: &NormalizedRecord,
    verdict: &ClassificationVerdict,
    now: DateTime<Utc>,
) -> NewSignal {
    // Link to what the source published, not the normalized form.
    let url = if rec.raw.url.trim().is_empty() {
        rec.normalized_url.clone()
    } else {
        rec.raw.url.trim().to_string()
    };
    NewSignal {
        source_id: rec.raw.source_id.clone(),
        message: format_message(&rec.raw.title, &url, verdict),
        url,
        relevance: verdict.relevance,
        urgency: verdict.urgency,
        category: verdict.category.clone(),
        emitted_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Validity, VerdictAction};

    fn v(object: &str, why: &str) -> ClassificationVerdict {
        ClassificationVerdict {
            relevance: 0.9,
            urgency: 4,
            category: "outage".into(),
            object: object.into(),
            why: why.into(),
            action: VerdictAction::Call,
            validity: Validity::Valid,
        }
    }

    #[test]
    fn message_has_fixed_layout() {
        let m = format_message("Boiler  house\nstopped", "https://e.com/a", &v("heat", "cold"));
        assert_eq!(
            m,
            "SIGNAL | outage | 4/5\nSphere: utilities\nSummary: Boiler house stopped\nWhy: cold\nSource: https://e.com/a"
        );
    }

    #[test]
    fn industrial_sphere_and_truncation() {
        let long = "x".repeat(400);
        let m = format_message(&long, "u", &v("industrial", &long));
        assert!(m.contains("Sphere: industry"));
        let summary = m.lines().nth(2).unwrap().trim_start_matches("Summary: ");
        assert_eq!(summary.chars().count(), MAX_SUMMARY_CHARS);
        assert!(summary.ends_with("..."));
    }
}
