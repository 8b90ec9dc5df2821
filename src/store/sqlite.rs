// src/store/sqlite.rs
//! SQLite-backed store.
//!
//! Connections run in WAL mode with a busy timeout. Each check-then-write is
//! one `BEGIN IMMEDIATE` transaction: SQLite takes the write lock up front, so
//! the read and the write cannot interleave with another connection, even one
//! in a different process.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

use super::{acquire_lock, DedupOutcome, FailureOutcome, SignalStore};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::hamming_distance;
use crate::model::{DecisionKind, DecisionRecord, NewSignal, QuotaState, Signal, Subscriber};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dedup_entries (
    url         TEXT PRIMARY KEY,
    fingerprint INTEGER NOT NULL,
    first_seen  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dedup_first_seen ON dedup_entries(first_seen);

CREATE TABLE IF NOT EXISTS quota_counters (
    day   TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS signals (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    day        TEXT NOT NULL,
    source_id  TEXT NOT NULL,
    url        TEXT NOT NULL,
    relevance  REAL NOT NULL,
    urgency    INTEGER NOT NULL,
    category   TEXT NOT NULL,
    message    TEXT NOT NULL,
    emitted_at INTEGER NOT NULL,
    recipients INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_signals_day ON signals(day);

CREATE TABLE IF NOT EXISTS subscribers (
    id                   TEXT PRIMARY KEY,
    active               INTEGER NOT NULL DEFAULT 1,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS decisions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    url        TEXT NOT NULL,
    kind       TEXT NOT NULL,
    reason     TEXT NOT NULL,
    decided_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_at ON decisions(decided_at);

CREATE TABLE IF NOT EXISTS leases (
    name       TEXT PRIMARY KEY,
    holder     TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_day(s: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StoreError::Backend(format!("bad day key `{s}`: {e}")))
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("bad timestamp {ms}")))
}

/// Conditional increment inside an open transaction.
fn reserve_in(tx: &rusqlite::Transaction<'_>, day: &str, max: u32) -> StoreResult<bool> {
    tx.execute(
        "INSERT OR IGNORE INTO quota_counters (day, count) VALUES (?1, 0)",
        params![day],
    )?;
    let changed = tx.execute(
        "UPDATE quota_counters SET count = count + 1 WHERE day = ?1 AND count < ?2",
        params![day, i64::from(max)],
    )?;
    Ok(changed == 1)
}

type SignalRow = (i64, String, String, String, f64, i64, String, String, i64, i64);

fn signal_from_row(r: SignalRow) -> StoreResult<Signal> {
    let (id, day, source_id, url, relevance, urgency, category, message, emitted_at, recipients) =
        r;
    Ok(Signal {
        id,
        date: parse_day(&day)?,
        source_id,
        url,
        relevance: relevance as f32,
        urgency: u8::try_from(urgency).unwrap_or(u8::MAX),
        category,
        message,
        emitted_at: from_millis(emitted_at)?,
        recipients: u32::try_from(recipients).unwrap_or(0),
    })
}

impl SignalStore for SqliteStore {
    fn check_and_insert(
        &self,
        url: &str,
        fingerprint: u64,
        hamming_threshold: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<DedupOutcome> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let url_seen: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM dedup_entries WHERE url = ?1",
                params![url],
                |r| r.get(0),
            )
            .optional()?;
        if url_seen.is_some() {
            return Ok(DedupOutcome::DuplicateUrl);
        }

        if fingerprint != 0 {
            let mut nearest: Option<u32> = None;
            {
                let mut stmt =
                    tx.prepare("SELECT fingerprint FROM dedup_entries WHERE fingerprint != 0")?;
                let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
                for fp in rows {
                    let d = hamming_distance(fp? as u64, fingerprint);
                    nearest = Some(nearest.map_or(d, |n| n.min(d)));
                }
            }
            if let Some(distance) = nearest.filter(|d| *d <= hamming_threshold) {
                return Ok(DedupOutcome::NearDuplicate { distance });
            }
        }

        tx.execute(
            "INSERT INTO dedup_entries (url, fingerprint, first_seen) VALUES (?1, ?2, ?3)",
            params![url, fingerprint as i64, now.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(DedupOutcome::New)
    }

    fn purge_dedup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = acquire_lock(&self.conn);
        let n = conn.execute(
            "DELETE FROM dedup_entries WHERE first_seen < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(n)
    }

    fn dedup_len(&self) -> StoreResult<usize> {
        let conn = acquire_lock(&self.conn);
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dedup_entries", [], |r| r.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn quota(&self, date: NaiveDate, max: u32) -> StoreResult<QuotaState> {
        let conn = acquire_lock(&self.conn);
        let count: Option<i64> = conn
            .query_row(
                "SELECT count FROM quota_counters WHERE day = ?1",
                params![day_key(date)],
                |r| r.get(0),
            )
            .optional()?;
        Ok(QuotaState {
            date,
            count: u32::try_from(count.unwrap_or(0)).unwrap_or(u32::MAX),
            max,
        })
    }

    fn try_reserve(&self, date: NaiveDate, max: u32) -> StoreResult<bool> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ok = reserve_in(&tx, &day_key(date), max)?;
        tx.commit()?;
        Ok(ok)
    }

    fn reserve_and_record_signal(
        &self,
        date: NaiveDate,
        max: u32,
        signal: NewSignal,
    ) -> StoreResult<Option<Signal>> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let day = day_key(date);
        if !reserve_in(&tx, &day, max)? {
            // Nothing written; dropping the transaction rolls it back.
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO signals (day, source_id, url, relevance, urgency, category, message, emitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                day,
                signal.source_id,
                signal.url,
                f64::from(signal.relevance),
                i64::from(signal.urgency),
                signal.category,
                signal.message,
                signal.emitted_at.timestamp_millis(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(Signal::from_new(id, date, signal)))
    }

    fn set_recipients(&self, signal_id: i64, recipients: u32) -> StoreResult<()> {
        let conn = acquire_lock(&self.conn);
        let n = conn.execute(
            "UPDATE signals SET recipients = ?1 WHERE id = ?2",
            params![i64::from(recipients), signal_id],
        )?;
        if n == 0 {
            return Err(StoreError::Backend(format!("unknown signal {signal_id}")));
        }
        Ok(())
    }

    fn signals_on(&self, date: NaiveDate) -> StoreResult<Vec<Signal>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, day, source_id, url, relevance, urgency, category, message, emitted_at, recipients
             FROM signals WHERE day = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![day_key(date)], |r| -> rusqlite::Result<SignalRow> {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(signal_from_row(row?)?);
        }
        Ok(out)
    }

    fn activate_subscriber(&self, id: &str) -> StoreResult<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO subscribers (id, active, consecutive_failures) VALUES (?1, 1, 0)
             ON CONFLICT(id) DO UPDATE SET active = 1, consecutive_failures = 0",
            params![id],
        )?;
        Ok(())
    }

    fn deactivate_subscriber(&self, id: &str) -> StoreResult<()> {
        let conn = acquire_lock(&self.conn);
        let n = conn.execute(
            "UPDATE subscribers SET active = 0 WHERE id = ?1",
            params![id],
        )?;
        if n == 0 {
            return Err(StoreError::UnknownSubscriber(id.to_string()));
        }
        Ok(())
    }

    fn subscriber(&self, id: &str) -> StoreResult<Option<Subscriber>> {
        let conn = acquire_lock(&self.conn);
        let row = conn
            .query_row(
                "SELECT id, active, consecutive_failures FROM subscribers WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Subscriber {
                        id: r.get(0)?,
                        active: r.get::<_, i64>(1)? != 0,
                        consecutive_failures: r.get::<_, u32>(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn active_subscribers(&self) -> StoreResult<Vec<Subscriber>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, consecutive_failures FROM subscribers WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(Subscriber {
                id: r.get(0)?,
                active: true,
                consecutive_failures: r.get::<_, u32>(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn record_delivery_success(&self, id: &str) -> StoreResult<()> {
        let conn = acquire_lock(&self.conn);
        let n = conn.execute(
            "UPDATE subscribers SET consecutive_failures = 0 WHERE id = ?1",
            params![id],
        )?;
        if n == 0 {
            return Err(StoreError::UnknownSubscriber(id.to_string()));
        }
        Ok(())
    }

    fn record_delivery_failure(&self, id: &str, threshold: u32) -> StoreResult<FailureOutcome> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "UPDATE subscribers SET consecutive_failures = consecutive_failures + 1 WHERE id = ?1",
            params![id],
        )?;
        if n == 0 {
            return Err(StoreError::UnknownSubscriber(id.to_string()));
        }
        let (active, failures): (i64, u32) = tx.query_row(
            "SELECT active, consecutive_failures FROM subscribers WHERE id = ?1",
            params![id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let deactivated = active != 0 && failures >= threshold;
        if deactivated {
            tx.execute(
                "UPDATE subscribers SET active = 0 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(FailureOutcome {
            consecutive_failures: failures,
            deactivated,
        })
    }

    fn record_decision(&self, record: &DecisionRecord) -> StoreResult<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO decisions (url, kind, reason, decided_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.normalized_url,
                record.kind.as_str(),
                record.reason,
                record.decided_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn recent_decisions(&self, limit: usize) -> StoreResult<Vec<DecisionRecord>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT url, kind, reason, decided_at FROM decisions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (url, kind, reason, at) = row?;
            let kind = DecisionKind::parse(&kind)
                .ok_or_else(|| StoreError::Backend(format!("bad decision kind `{kind}`")))?;
            out.push(DecisionRecord {
                normalized_url: url,
                kind,
                reason,
                decided_at: from_millis(at)?,
            });
        }
        Ok(out)
    }

    fn purge_archive(
        &self,
        decisions_before: DateTime<Utc>,
        signals_before: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut n = tx.execute(
            "DELETE FROM decisions WHERE decided_at < ?1",
            params![decisions_before.timestamp_millis()],
        )?;
        n += tx.execute(
            "DELETE FROM signals WHERE emitted_at < ?1",
            params![signals_before.timestamp_millis()],
        )?;
        n += tx.execute(
            "DELETE FROM quota_counters WHERE day < ?1",
            params![day_key(signals_before.date_naive())],
        )?;
        tx.commit()?;
        Ok(n)
    }

    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<bool> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder, expires_at FROM leases WHERE name = ?1",
                params![name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((h, expires_at)) = current {
            if h != holder && expires_at > now.timestamp_millis() {
                return Ok(false);
            }
        }
        let expires_at = (now + chrono::Duration::seconds(ttl_secs)).timestamp_millis();
        tx.execute(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
            params![name, holder, expires_at],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<bool> {
        let conn = acquire_lock(&self.conn);
        let expires_at = (now + chrono::Duration::seconds(ttl_secs)).timestamp_millis();
        let n = conn.execute(
            "UPDATE leases SET expires_at = MAX(expires_at, ?3) WHERE name = ?1 AND holder = ?2",
            params![name, holder, expires_at],
        )?;
        Ok(n == 1)
    }

    fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }
}
