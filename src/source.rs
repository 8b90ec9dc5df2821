// src/source.rs
//! Fetch collaborator interface. Feeds are fetched elsewhere; the pipeline
//! only consumes `RawItem`s through `ItemSource`.
//!
//! Fetching is two-phase: `fetch` hands out up to `limit` items without
//! consuming them, `ack` consumes what the last fetch handed out. The
//! pipeline acks only after a run completes, so items left over by the batch
//! limit or by an aborted run are fetched again next time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::RawItem;
use crate::store::acquire_lock;

#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Up to `limit` pending items, oldest first. Nothing is consumed.
    async fn fetch(&self, limit: usize) -> Result<Vec<RawItem>>;

    /// Consume everything the previous `fetch` returned.
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Pull from every source, `limit` items in total; a failing source is
/// logged and skipped. Every source is fetched (possibly with 0) so a later
/// `ack` never consumes items handed out by an earlier, abandoned fetch.
pub async fn collect(sources: &[Arc<dyn ItemSource>], limit: usize) -> Vec<RawItem> {
    let mut raw = Vec::new();
    for s in sources {
        let room = limit.saturating_sub(raw.len());
        match s.fetch(room).await {
            Ok(mut v) => {
                v.truncate(room);
                counter!("source_items_total", "source" => s.name()).increment(v.len() as u64);
                raw.append(&mut v);
            }
            Err(e) => {
                tracing::warn!(target: "source", error = ?e, source = s.name(), "source error");
                counter!("source_errors_total", "source" => s.name()).increment(1);
            }
        }
    }
    raw
}

/// Consume what the last `collect` handed out. Failures are logged; the
/// affected items come back on the next fetch and dedup absorbs them.
pub async fn ack_all(sources: &[Arc<dyn ItemSource>]) {
    for s in sources {
        if let Err(e) = s.ack().await {
            tracing::warn!(target: "source", error = ?e, source = s.name(), "ack failed");
            counter!("source_errors_total", "source" => s.name()).increment(1);
        }
    }
}

fn note_deferred(source: &'static str, deferred: usize) {
    if deferred > 0 {
        counter!("records_deferred_total", "source" => source).increment(deferred as u64);
        tracing::warn!(target: "source", source, deferred, "batch limit reached, rest stays queued");
    }
}

/// In-memory queue; acked items are removed.
#[derive(Debug, Default)]
pub struct VecSource {
    items: Mutex<VecDeque<RawItem>>,
    handed_out: Mutex<usize>,
}

impl VecSource {
    pub fn new(items: Vec<RawItem>) -> Self {
        Self {
            items: Mutex::new(items.into()),
            handed_out: Mutex::new(0),
        }
    }

    pub fn pending(&self) -> usize {
        acquire_lock(&self.items).len()
    }
}

#[async_trait]
impl ItemSource for VecSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<RawItem>> {
        let items = acquire_lock(&self.items);
        let out: Vec<RawItem> = items.iter().take(limit).cloned().collect();
        *acquire_lock(&self.handed_out) = out.len();
        note_deferred(self.name(), items.len() - out.len());
        Ok(out)
    }

    async fn ack(&self) -> Result<()> {
        let n = std::mem::take(&mut *acquire_lock(&self.handed_out));
        let mut items = acquire_lock(&self.items);
        let n = n.min(items.len());
        items.drain(..n);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Directory spool written by the fetcher: `*.json` files holding either one
/// item or an array, `*.jsonl` files with one item per line. Fully consumed
/// files are moved to `processed/`; a partly consumed file is rewritten with
/// the items still queued.
#[derive(Debug)]
pub struct SpoolSource {
    dir: PathBuf,
    last_fetch: Mutex<Vec<(PathBuf, Disposition)>>,
}

/// What `ack` does with a spool file after the fetch that looked at it.
#[derive(Debug)]
enum Disposition {
    Consumed,
    Partial { rest: Vec<SpoolItem>, jsonl: bool },
    Untouched,
    /// Unreadable; moved aside so it does not block the spool.
    Bad,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolItem {
    source_id: String,
    url: String,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fetched_at: Option<DateTime<Utc>>,
}

impl SpoolItem {
    fn into_raw(self, now: DateTime<Utc>) -> RawItem {
        RawItem {
            source_id: self.source_id,
            url: self.url,
            title: self.title,
            body: self.body,
            published_at: self.published_at,
            fetched_at: self.fetched_at.unwrap_or(now),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpoolFile {
    Many(Vec<SpoolItem>),
    One(SpoolItem),
}

fn parse_spool(content: &str, jsonl: bool) -> Result<Vec<SpoolItem>> {
    if jsonl {
        return content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<SpoolItem>(l).map_err(Into::into))
            .collect();
    }
    Ok(match serde_json::from_str::<SpoolFile>(content)? {
        SpoolFile::Many(v) => v,
        SpoolFile::One(i) => vec![i],
    })
}

fn serialize_spool(items: &[SpoolItem], jsonl: bool) -> Result<String> {
    if !jsonl {
        return Ok(serde_json::to_string(items)?);
    }
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    Ok(out)
}

impl SpoolSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_fetch: Mutex::new(Vec::new()),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<SpoolItem>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading spool file {}", path.display()))?;
        parse_spool(&content, is_jsonl(path))
            .with_context(|| format!("parsing spool file {}", path.display()))
    }

    async fn spool_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("json") | Some("jsonl")) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn move_to_processed(&self, path: &Path) -> Result<()> {
        let processed = self.dir.join("processed");
        tokio::fs::create_dir_all(&processed).await?;
        if let Some(name) = path.file_name() {
            tokio::fs::rename(path, processed.join(name))
                .await
                .with_context(|| format!("moving {} to processed/", path.display()))?;
        }
        Ok(())
    }

    /// Replace `path` with the still-queued items (write aside, then rename).
    async fn rewrite(&self, path: &Path, rest: &[SpoolItem], jsonl: bool) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, serialize_spool(rest, jsonl)?).await?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rewriting spool file {}", path.display()))?;
        Ok(())
    }
}

fn is_jsonl(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("jsonl")
}

#[async_trait]
impl ItemSource for SpoolSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<RawItem>> {
        acquire_lock(&self.last_fetch).clear();
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut out = Vec::new();
        let mut plan = Vec::new();
        let mut deferred = 0usize;
        for path in self.spool_files().await? {
            let mut items = match self.read_file(&path).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(target: "source", error = ?e, "skipping bad spool file");
                    plan.push((path, Disposition::Bad));
                    continue;
                }
            };
            let room = limit - out.len();
            let disposition = if room == 0 {
                deferred += items.len();
                Disposition::Untouched
            } else if items.len() <= room {
                out.extend(items.into_iter().map(|i| i.into_raw(now)));
                Disposition::Consumed
            } else {
                let rest = items.split_off(room);
                deferred += rest.len();
                out.extend(items.into_iter().map(|i| i.into_raw(now)));
                Disposition::Partial {
                    rest,
                    jsonl: is_jsonl(&path),
                }
            };
            plan.push((path, disposition));
        }

        note_deferred(self.name(), deferred);
        *acquire_lock(&self.last_fetch) = plan;
        Ok(out)
    }

    async fn ack(&self) -> Result<()> {
        let plan = std::mem::take(&mut *acquire_lock(&self.last_fetch));
        for (path, disposition) in plan {
            match disposition {
                Disposition::Consumed | Disposition::Bad => self.move_to_processed(&path).await?,
                Disposition::Partial { rest, jsonl } => self.rewrite(&path, &rest, jsonl).await?,
                Disposition::Untouched => {}
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "spool"
    }
}
