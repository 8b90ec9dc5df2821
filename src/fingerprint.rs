// src/fingerprint.rs
//! Identity of a raw item: canonical URL, normalized text and a 64-bit
//! simhash over word shingles. Everything here is pure and deterministic, so
//! a re-fetched copy of an article always maps to the same record.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::DedupConfig;
use crate::model::{NormalizedRecord, RawItem};

/// Build the NormalizedRecord for a raw item. Never fails.
pub fn identify(raw: RawItem, cfg: &DedupConfig) -> NormalizedRecord {
    let normalized_url = normalize_url(&raw.url, &cfg.tracking_params);
    let title = normalize_text(&raw.title);
    let body = normalize_text(&raw.body);

    let normalized_text = match (title.is_empty(), body.is_empty()) {
        (false, false) => format!("{title} {body}"),
        (false, true) => title.clone(),
        _ => body.clone(),
    };

    // Fingerprint covers the title and the lead of the body only.
    let lead: String = body.chars().take(cfg.dedup_body_chars).collect();
    let fingerprint = simhash(&format!("{title} {lead}"), cfg.shingle_width);

    NormalizedRecord {
        raw,
        normalized_url,
        normalized_text,
        fingerprint,
    }
}

/// Canonical form of a URL: lowercased scheme/host, tracking parameters and
/// fragment removed, remaining query pairs sorted, trailing slash trimmed.
///
/// Total: unparseable input is cleaned up textually instead of rejected.
pub fn normalize_url(raw: &str, tracking_params: &[String]) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut url = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return normalize_url_fallback(trimmed),
    };

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, v)| !v.is_empty() && !is_tracking_param(k, tracking_params))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let path = url.path().trim_end_matches('/').to_string();
    if !path.is_empty() {
        url.set_path(&path);
    }

    url.to_string()
}

fn is_tracking_param(key: &str, tracking_params: &[String]) -> bool {
    tracking_params.iter().any(|p| p.eq_ignore_ascii_case(key))
}

fn normalize_url_fallback(s: &str) -> String {
    let no_fragment = s.split('#').next().unwrap_or(s);
    let (head, query) = match no_fragment.split_once('?') {
        Some((h, q)) => (h, Some(q)),
        None => (no_fragment, None),
    };
    let mut out = head.trim_end_matches('/').to_lowercase();
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(q);
    }
    out
}

/// Lowercase, decode entities, strip markup, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    static RE_BLOCKS: OnceCell<Regex> = OnceCell::new();
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();

    let re_blocks = RE_BLOCKS.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)\s*>")
            .expect("block regex")
    });
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("ws regex"));

    let out = re_blocks.replace_all(s, " ");
    let out = re_tags.replace_all(&out, " ");
    // Decode after stripping so that `&lt;b&gt;` survives as literal text.
    let out = html_escape::decode_html_entities(&out);
    let out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");
    let out = re_ws.replace_all(&out, " ");
    out.trim().to_lowercase()
}

/// Tokens used for shingling: punctuation dropped, words of 3+ chars.
pub fn tokens(text: &str) -> Vec<String> {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// 64-bit simhash over `width`-token shingles. Returns 0 for text without
/// usable tokens; 0 is never matched as a near-duplicate.
pub fn simhash(text: &str, width: usize) -> u64 {
    let toks = tokens(text);
    if toks.is_empty() {
        return 0;
    }
    let width = width.max(1);

    let shingles: Vec<String> = if toks.len() < width {
        vec![toks.join(" ")]
    } else {
        toks.windows(width).map(|w| w.join(" ")).collect()
    };

    let mut acc = [0i32; 64];
    for sh in &shingles {
        let h = feature_hash(sh);
        for (bit, slot) in acc.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }

    acc.iter()
        .enumerate()
        .filter(|(_, v)| **v > 0)
        .fold(0u64, |fp, (bit, _)| fp | (1u64 << bit))
}

/// Stable 64-bit feature hash (first 8 bytes of SHA-256).
fn feature_hash(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// 12 hex chars of SHA-256, used as an anonymized id in logs.
pub fn short_hash(text: &str) -> String {
    use std::fmt::Write as _;
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
