//! SQLite storage layer.
//!
//! Single source of truth for jobs, queues, dependency edges, tags,
//! recurring templates, stats, events, and config. Every engine operation
//! runs inside one transaction here; that transaction is the atomicity
//! boundary the rest of the crate relies on.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::stats::QueueStats;

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// All methods delegate to the same SQL as the direct `Storage` readers,
/// but execute against the transaction's connection, so either every write
/// in an operation commits or none do.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing and ephemeral queues).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                jid             TEXT PRIMARY KEY,
                queue           TEXT,
                data            TEXT NOT NULL DEFAULT 'null',
                priority        INTEGER NOT NULL DEFAULT 0,
                state           TEXT NOT NULL,
                tags            TEXT NOT NULL DEFAULT '[]',
                worker          TEXT,
                expires_at      INTEGER,
                remaining       INTEGER NOT NULL,
                retries         INTEGER NOT NULL,
                ready_at        INTEGER,
                put_seq         INTEGER,
                tracked         INTEGER NOT NULL DEFAULT 0,
                failure         TEXT,
                failure_group   TEXT,
                history         TEXT NOT NULL DEFAULT '[]',
                spawned_from    TEXT,
                terminal_at     INTEGER,
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state);
            CREATE INDEX IF NOT EXISTS idx_jobs_waiting ON jobs(queue, priority DESC, put_seq ASC)
                WHERE state = 'waiting';
            CREATE INDEX IF NOT EXISTS idx_jobs_scheduled ON jobs(queue, ready_at ASC)
                WHERE state = 'scheduled';
            CREATE INDEX IF NOT EXISTS idx_jobs_running ON jobs(queue, expires_at ASC)
                WHERE state = 'running';
            CREATE INDEX IF NOT EXISTS idx_jobs_terminal ON jobs(terminal_at ASC)
                WHERE state IN ('completed', 'canceled');
            CREATE INDEX IF NOT EXISTS idx_jobs_failed ON jobs(failure_group)
                WHERE state = 'failed';

            CREATE TABLE IF NOT EXISTS deps (
                jid     TEXT NOT NULL,
                on_jid  TEXT NOT NULL,
                PRIMARY KEY (jid, on_jid)
            );

            CREATE INDEX IF NOT EXISTS idx_deps_on ON deps(on_jid);

            CREATE TABLE IF NOT EXISTS tags (
                tag     TEXT NOT NULL,
                jid     TEXT NOT NULL,
                PRIMARY KEY (tag, jid)
            );

            CREATE INDEX IF NOT EXISTS idx_tags_jid ON tags(jid);

            CREATE TABLE IF NOT EXISTS queues (
                name        TEXT PRIMARY KEY,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recurring (
                jid         TEXT PRIMARY KEY,
                queue       TEXT NOT NULL,
                data        TEXT NOT NULL DEFAULT 'null',
                priority    INTEGER NOT NULL DEFAULT 0,
                interval_ms INTEGER NOT NULL,
                next_at     INTEGER NOT NULL,
                tags        TEXT NOT NULL DEFAULT '[]',
                retries     INTEGER NOT NULL,
                spawned     INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_recurring_queue ON recurring(queue, next_at);

            CREATE TABLE IF NOT EXISTS stats (
                queue   TEXT NOT NULL,
                day     INTEGER NOT NULL,
                wait    TEXT NOT NULL,
                run     TEXT NOT NULL,
                failed  INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue, day)
            );

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   INTEGER NOT NULL,
                kind        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counters (
                name    TEXT PRIMARY KEY,
                value   INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO counters (name, value) VALUES ('put_seq', 0);
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// Commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let mut ctx = TxContext { tx: &tx };
        let result = f(&mut ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Direct readers (no write, no transaction needed)
    // -----------------------------------------------------------------------

    pub fn get_job(&self, jid: &Jid) -> Result<Option<Job>> {
        get_job_on(&self.conn, jid)
    }

    pub fn get_recurring(&self, jid: &Jid) -> Result<Option<RecurringJob>> {
        get_recurring_on(&self.conn, jid)
    }

    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        events_since_on(&self.conn, since_seq)
    }

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        config_get_on(&self.conn, key)
    }

    pub fn config_all(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM config ORDER BY key ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn queue_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM queues ORDER BY name ASC")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn queue_exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM queues WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn stats_get(&self, queue: &str, day: i64) -> Result<Option<QueueStats>> {
        stats_get_on(&self.conn, queue, day)
    }

    pub fn tagged(&self, tag: &str) -> Result<Vec<Jid>> {
        tagged_on(&self.conn, tag)
    }

    pub fn tracked_jids(&self) -> Result<Vec<Jid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT jid FROM jobs WHERE tracked = 1 ORDER BY jid ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    pub fn failed_counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT failure_group, COUNT(*) FROM jobs
             WHERE state = 'failed' AND failure_group IS NOT NULL
             GROUP BY failure_group ORDER BY failure_group ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn failed_jids(&self, group: &str, offset: u64, limit: u64) -> Result<Vec<Jid>> {
        let mut stmt = self.conn.prepare(
            "SELECT jid FROM jobs
             WHERE state = 'failed' AND failure_group = ?1
             ORDER BY terminal_at ASC, jid ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![group, limit as i64, offset as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    /// Jids in a queue+state, in that state's natural order.
    pub fn jids_in_state(
        &self,
        queue: &str,
        state: JobState,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Jid>> {
        let order = match state {
            JobState::Waiting => "priority DESC, put_seq ASC",
            JobState::Scheduled => "ready_at ASC",
            JobState::Running | JobState::Stalled => "expires_at ASC",
            _ => "jid ASC",
        };
        let sql = format!(
            "SELECT jid FROM jobs WHERE queue = ?1 AND state = ?2 ORDER BY {order} LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![queue, state.to_string(), limit as i64, offset as i64],
                |row| row.get::<_, String>(0),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    /// Running jobs in a queue whose lease already expired.
    pub fn stalled_jids(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Jid>> {
        expired_running_on(&self.conn, queue, now, offset, limit)
    }

    pub fn counts(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueCounts> {
        counts_on(&self.conn, queue, now)
    }
}

impl TxContext<'_> {
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        insert_job_on(self.tx, job)
    }

    pub fn save_job(&self, job: &Job) -> Result<()> {
        save_job_on(self.tx, job)
    }

    pub fn delete_job(&self, jid: &Jid) -> Result<()> {
        self.tx
            .execute("DELETE FROM jobs WHERE jid = ?1", params![jid.as_str()])?;
        self.tx
            .execute("DELETE FROM deps WHERE jid = ?1 OR on_jid = ?1", params![jid.as_str()])?;
        self.tx
            .execute("DELETE FROM tags WHERE jid = ?1", params![jid.as_str()])?;
        Ok(())
    }

    pub fn get_job(&self, jid: &Jid) -> Result<Option<Job>> {
        get_job_on(self.tx, jid)
    }

    /// Fetch a job that must exist.
    pub fn require_job(&self, jid: &Jid) -> Result<Job> {
        get_job_on(self.tx, jid)?.ok_or_else(|| Error::UnknownJob(jid.clone()))
    }

    /// Assign the insertion-sequence tie-breaker for the waiting ordering.
    pub fn set_put_seq(&self, jid: &Jid, put_seq: i64) -> Result<()> {
        set_put_seq_on(self.tx, jid, put_seq)
    }

    /// Stamp (or clear) the time a job reached a terminal state.
    pub fn set_terminal_at(&self, jid: &Jid, at: Option<DateTime<Utc>>) -> Result<()> {
        self.tx.execute(
            "UPDATE jobs SET terminal_at = ?2 WHERE jid = ?1",
            params![jid.as_str(), at.map(ms)],
        )?;
        Ok(())
    }

    pub fn next_put_seq(&self) -> Result<i64> {
        self.tx
            .execute("UPDATE counters SET value = value + 1 WHERE name = 'put_seq'", [])?;
        let seq = self.tx.query_row(
            "SELECT value FROM counters WHERE name = 'put_seq'",
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    pub fn ensure_queue(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
            params![name, ms(now)],
        )?;
        Ok(())
    }

    /// Oldest failed jids in a failure group, up to `limit`.
    pub fn failed_in_group(&self, group: &str, limit: u64) -> Result<Vec<Jid>> {
        let mut stmt = self.tx.prepare(
            "SELECT jid FROM jobs
             WHERE state = 'failed' AND failure_group = ?1
             ORDER BY terminal_at ASC, jid ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![group, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    // --- orderings --------------------------------------------------------

    pub fn waiting_jids(&self, queue: &str, limit: u64) -> Result<Vec<Jid>> {
        let mut stmt = self.tx.prepare(
            "SELECT jid FROM jobs WHERE queue = ?1 AND state = 'waiting'
             ORDER BY priority DESC, put_seq ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![queue, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    pub fn scheduled_ready_jids(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Jid>> {
        let mut stmt = self.tx.prepare(
            "SELECT jid FROM jobs WHERE queue = ?1 AND state = 'scheduled' AND ready_at <= ?2
             ORDER BY ready_at ASC",
        )?;
        let rows = stmt
            .query_map(params![queue, ms(now)], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    pub fn expired_running_jids(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Jid>> {
        expired_running_on(self.tx, queue, now, 0, u64::MAX)
    }

    // --- dependencies -----------------------------------------------------

    pub fn add_dep(&self, jid: &Jid, on_jid: &Jid) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO deps (jid, on_jid) VALUES (?1, ?2)",
            params![jid.as_str(), on_jid.as_str()],
        )?;
        Ok(())
    }

    pub fn remove_dep(&self, jid: &Jid, on_jid: &Jid) -> Result<()> {
        self.tx.execute(
            "DELETE FROM deps WHERE jid = ?1 AND on_jid = ?2",
            params![jid.as_str(), on_jid.as_str()],
        )?;
        Ok(())
    }

    /// Drop every edge touching this job, in both directions.
    pub fn remove_all_deps(&self, jid: &Jid) -> Result<()> {
        self.tx.execute(
            "DELETE FROM deps WHERE jid = ?1 OR on_jid = ?1",
            params![jid.as_str()],
        )?;
        Ok(())
    }

    pub fn dependents_of(&self, jid: &Jid) -> Result<Vec<Jid>> {
        let mut stmt = self
            .tx
            .prepare("SELECT jid FROM deps WHERE on_jid = ?1 ORDER BY jid ASC")?;
        let rows = stmt
            .query_map(params![jid.as_str()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Jid).collect())
    }

    pub fn unresolved_deps(&self, jid: &Jid) -> Result<Vec<Jid>> {
        depends_on_of(self.tx, jid)
    }

    // --- tags -------------------------------------------------------------

    pub fn add_tag(&self, tag: &str, jid: &Jid) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO tags (tag, jid) VALUES (?1, ?2)",
            params![tag, jid.as_str()],
        )?;
        Ok(())
    }

    pub fn remove_tag(&self, tag: &str, jid: &Jid) -> Result<()> {
        self.tx.execute(
            "DELETE FROM tags WHERE tag = ?1 AND jid = ?2",
            params![tag, jid.as_str()],
        )?;
        Ok(())
    }

    pub fn remove_all_tags(&self, jid: &Jid) -> Result<()> {
        self.tx
            .execute("DELETE FROM tags WHERE jid = ?1", params![jid.as_str()])?;
        Ok(())
    }

    // --- recurring --------------------------------------------------------

    pub fn insert_recurring(&self, template: &RecurringJob) -> Result<()> {
        self.tx.execute(
            "INSERT INTO recurring (jid, queue, data, priority, interval_ms, next_at, tags, retries, spawned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                template.jid.as_str(),
                template.queue,
                template.data.to_string(),
                template.priority,
                template.interval * 1000,
                ms(template.next_at),
                serde_json::to_string(&template.tags).unwrap_or_else(|_| "[]".into()),
                template.retries,
                template.spawned as i64,
            ],
        )?;
        Ok(())
    }

    pub fn save_recurring(&self, template: &RecurringJob) -> Result<()> {
        self.tx.execute(
            "UPDATE recurring SET queue = ?2, data = ?3, priority = ?4, interval_ms = ?5,
             next_at = ?6, tags = ?7, retries = ?8, spawned = ?9 WHERE jid = ?1",
            params![
                template.jid.as_str(),
                template.queue,
                template.data.to_string(),
                template.priority,
                template.interval * 1000,
                ms(template.next_at),
                serde_json::to_string(&template.tags).unwrap_or_else(|_| "[]".into()),
                template.retries,
                template.spawned as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete_recurring(&self, jid: &Jid) -> Result<bool> {
        let n = self
            .tx
            .execute("DELETE FROM recurring WHERE jid = ?1", params![jid.as_str()])?;
        Ok(n > 0)
    }

    pub fn get_recurring(&self, jid: &Jid) -> Result<Option<RecurringJob>> {
        get_recurring_on(self.tx, jid)
    }

    /// Templates in a queue that are due at or before `now`.
    pub fn due_recurring(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        let mut stmt = self.tx.prepare(
            "SELECT jid, queue, data, priority, interval_ms, next_at, tags, retries, spawned
             FROM recurring WHERE queue = ?1 AND next_at <= ?2 ORDER BY next_at ASC",
        )?;
        let rows = stmt
            .query_map(params![queue, ms(now)], row_to_recurring)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recurring_exists(&self, jid: &Jid) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM recurring WHERE jid = ?1",
                params![jid.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // --- stats ------------------------------------------------------------

    pub fn stats_get(&self, queue: &str, day: i64) -> Result<Option<QueueStats>> {
        stats_get_on(self.tx, queue, day)
    }

    pub fn stats_save(&self, stats: &QueueStats) -> Result<()> {
        self.tx.execute(
            "INSERT INTO stats (queue, day, wait, run, failed, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (queue, day) DO UPDATE SET
                wait = excluded.wait, run = excluded.run,
                failed = excluded.failed, retries = excluded.retries",
            params![
                stats.queue,
                stats.day,
                serde_json::to_string(&stats.wait)
                    .map_err(|e| Error::Other(format!("encode wait stats: {e}")))?,
                serde_json::to_string(&stats.run)
                    .map_err(|e| Error::Other(format!("encode run stats: {e}")))?,
                stats.failed as i64,
                stats.retries as i64,
            ],
        )?;
        Ok(())
    }

    // --- events -----------------------------------------------------------

    pub fn record_event(&mut self, kind: EventKind, now: DateTime<Utc>) -> Result<Event> {
        self.tx.execute(
            "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
            params![
                ms(now),
                serde_json::to_string(&kind).unwrap_or_default(),
            ],
        )?;
        let seq = self.tx.last_insert_rowid();
        Ok(Event {
            seq: seq as u64,
            timestamp: now,
            kind,
        })
    }

    // --- config -----------------------------------------------------------

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        config_get_on(self.tx, key)
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.tx.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn config_unset(&self, key: &str) -> Result<()> {
        self.tx
            .execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    // --- retention --------------------------------------------------------

    /// Purgeable terminal jobs: completed/canceled older than `cutoff`, plus
    /// any beyond the newest `keep` regardless of age. Oldest first.
    pub fn purgeable_jids(&self, cutoff: DateTime<Utc>, keep: i64) -> Result<Vec<Jid>> {
        let mut out = Vec::new();

        let mut stmt = self.tx.prepare(
            "SELECT jid FROM jobs
             WHERE state IN ('completed', 'canceled') AND terminal_at < ?1
             ORDER BY terminal_at ASC",
        )?;
        let rows = stmt
            .query_map(params![ms(cutoff)], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        out.extend(rows);

        let mut stmt = self.tx.prepare(
            "SELECT jid FROM jobs
             WHERE state IN ('completed', 'canceled')
             ORDER BY terminal_at DESC LIMIT -1 OFFSET ?1",
        )?;
        let rows = stmt
            .query_map(params![keep.max(0)], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        out.extend(rows);

        out.sort();
        out.dedup();
        Ok(out.into_iter().map(Jid).collect())
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers — integer milliseconds in storage, chrono in the model.
// ---------------------------------------------------------------------------

pub(crate) fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (derefs to Connection).
// ---------------------------------------------------------------------------

fn insert_job_on(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (
            jid, queue, data, priority, state, tags, worker, expires_at,
            remaining, retries, ready_at, put_seq, tracked, failure,
            failure_group, history, spawned_from, terminal_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            job.jid.as_str(),
            job.queue,
            job.data.to_string(),
            job.priority,
            job.state.to_string(),
            serde_json::to_string(&job.tags).unwrap_or_else(|_| "[]".into()),
            job.worker,
            job.expires_at.map(ms),
            job.remaining,
            job.retries,
            job.ready_at.map(ms),
            None::<i64>, // put_seq, assigned on enqueue-to-waiting
            job.tracked,
            job.failure
                .as_ref()
                .map(|f| serde_json::to_string(f).unwrap_or_default()),
            job.failure.as_ref().map(|f| f.group.clone()),
            serde_json::to_string(&job.history).unwrap_or_else(|_| "[]".into()),
            job.spawned_from.as_ref().map(|j| j.as_str().to_string()),
            None::<i64>, // terminal_at
            ms(job.created_at),
        ],
    )?;
    Ok(())
}

fn save_job_on(conn: &Connection, job: &Job) -> Result<()> {
    let n = conn.execute(
        "UPDATE jobs SET
            queue = ?2, data = ?3, priority = ?4, state = ?5, tags = ?6,
            worker = ?7, expires_at = ?8, remaining = ?9, retries = ?10,
            ready_at = ?11, tracked = ?12, failure = ?13, failure_group = ?14,
            history = ?15
         WHERE jid = ?1",
        params![
            job.jid.as_str(),
            job.queue,
            job.data.to_string(),
            job.priority,
            job.state.to_string(),
            serde_json::to_string(&job.tags).unwrap_or_else(|_| "[]".into()),
            job.worker,
            job.expires_at.map(ms),
            job.remaining,
            job.retries,
            job.ready_at.map(ms),
            job.tracked,
            job.failure
                .as_ref()
                .map(|f| serde_json::to_string(f).unwrap_or_default()),
            job.failure.as_ref().map(|f| f.group.clone()),
            serde_json::to_string(&job.history).unwrap_or_else(|_| "[]".into()),
        ],
    )?;
    if n == 0 {
        return Err(Error::UnknownJob(job.jid.clone()));
    }
    Ok(())
}

pub(crate) fn set_put_seq_on(conn: &Connection, jid: &Jid, put_seq: i64) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET put_seq = ?2 WHERE jid = ?1",
        params![jid.as_str(), put_seq],
    )?;
    Ok(())
}

fn get_job_on(conn: &Connection, jid: &Jid) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            "SELECT jid, queue, data, priority, state, tags, worker, expires_at,
                    remaining, retries, ready_at, tracked, failure, history,
                    spawned_from, created_at
             FROM jobs WHERE jid = ?1",
            params![jid.as_str()],
            row_to_job,
        )
        .optional()?;

    let Some(mut job) = row else {
        return Ok(None);
    };

    job.depends_on = depends_on_of(conn, jid)?;
    let mut stmt = conn.prepare("SELECT jid FROM deps WHERE on_jid = ?1 ORDER BY jid ASC")?;
    let dependents = stmt
        .query_map(params![jid.as_str()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    job.dependents = dependents.into_iter().map(Jid).collect();

    Ok(Some(job))
}

fn depends_on_of(conn: &Connection, jid: &Jid) -> Result<Vec<Jid>> {
    let mut stmt = conn.prepare("SELECT on_jid FROM deps WHERE jid = ?1 ORDER BY on_jid ASC")?;
    let rows = stmt
        .query_map(params![jid.as_str()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(Jid).collect())
}

fn expired_running_on(
    conn: &Connection,
    queue: &str,
    now: DateTime<Utc>,
    offset: u64,
    limit: u64,
) -> Result<Vec<Jid>> {
    let mut stmt = conn.prepare(
        "SELECT jid FROM jobs
         WHERE queue = ?1 AND state = 'running' AND expires_at <= ?2
         ORDER BY expires_at ASC LIMIT ?3 OFFSET ?4",
    )?;
    let limit = limit.min(i64::MAX as u64) as i64;
    let rows = stmt
        .query_map(params![queue, ms(now), limit, offset as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(Jid).collect())
}

fn counts_on(conn: &Connection, queue: &str, now: DateTime<Utc>) -> Result<QueueCounts> {
    let count_state = |state: &str| -> Result<u64> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND state = ?2",
            params![queue, state],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    };

    let stalled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND state = 'running' AND expires_at <= ?2",
        params![queue, ms(now)],
        |row| row.get(0),
    )?;
    let running = count_state("running")?;
    let recurring: i64 = conn.query_row(
        "SELECT COUNT(*) FROM recurring WHERE queue = ?1",
        params![queue],
        |row| row.get(0),
    )?;

    Ok(QueueCounts {
        name: queue.to_string(),
        waiting: count_state("waiting")?,
        scheduled: count_state("scheduled")?,
        running: running.saturating_sub(stalled as u64),
        stalled: stalled as u64,
        depends: count_state("depends")?,
        recurring: recurring as u64,
    })
}

fn get_recurring_on(conn: &Connection, jid: &Jid) -> Result<Option<RecurringJob>> {
    let row = conn
        .query_row(
            "SELECT jid, queue, data, priority, interval_ms, next_at, tags, retries, spawned
             FROM recurring WHERE jid = ?1",
            params![jid.as_str()],
            row_to_recurring,
        )
        .optional()?;
    Ok(row)
}

fn stats_get_on(conn: &Connection, queue: &str, day: i64) -> Result<Option<QueueStats>> {
    let row = conn
        .query_row(
            "SELECT queue, day, wait, run, failed, retries FROM stats
             WHERE queue = ?1 AND day = ?2",
            params![queue, day],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((queue, day, wait, run, failed, retries)) = row else {
        return Ok(None);
    };

    Ok(Some(QueueStats {
        queue,
        day,
        wait: serde_json::from_str(&wait)
            .map_err(|e| Error::Other(format!("decode wait stats: {e}")))?,
        run: serde_json::from_str(&run)
            .map_err(|e| Error::Other(format!("decode run stats: {e}")))?,
        failed: failed as u64,
        retries: retries as u64,
    }))
}

fn tagged_on(conn: &Connection, tag: &str) -> Result<Vec<Jid>> {
    let mut stmt = conn.prepare("SELECT jid FROM tags WHERE tag = ?1 ORDER BY jid ASC")?;
    let rows = stmt
        .query_map(params![tag], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(Jid).collect())
}

fn events_since_on(conn: &Connection, since_seq: u64) -> Result<Vec<Event>> {
    let mut stmt =
        conn.prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;
    let events = stmt
        .query_map(params![since_seq as i64], |row| {
            let kind_str: String = row.get(2)?;
            Ok(Event {
                seq: row.get::<_, i64>(0)? as u64,
                timestamp: from_ms(row.get::<_, i64>(1)?),
                kind: serde_json::from_str(&kind_str)
                    .unwrap_or(EventKind::Unknown { raw: kind_str }),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

fn config_get_on(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let data_str: String = row.get(2)?;
    let state_str: String = row.get(4)?;
    let tags_str: String = row.get(5)?;
    let failure_str: Option<String> = row.get(12)?;
    let history_str: String = row.get(13)?;

    Ok(Job {
        jid: Jid(row.get::<_, String>(0)?),
        queue: row.get(1)?,
        data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
        priority: row.get(3)?,
        state: state_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        worker: row.get(6)?,
        expires_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        remaining: row.get(8)?,
        retries: row.get(9)?,
        ready_at: row.get::<_, Option<i64>>(10)?.map(from_ms),
        depends_on: Vec::new(),
        dependents: Vec::new(),
        tracked: row.get(11)?,
        failure: failure_str.and_then(|s| serde_json::from_str(&s).ok()),
        history: serde_json::from_str(&history_str).unwrap_or_default(),
        spawned_from: row.get::<_, Option<String>>(14)?.map(Jid),
        created_at: from_ms(row.get::<_, i64>(15)?),
    })
}

fn row_to_recurring(row: &rusqlite::Row) -> rusqlite::Result<RecurringJob> {
    let data_str: String = row.get(2)?;
    let tags_str: String = row.get(6)?;
    Ok(RecurringJob {
        jid: Jid(row.get::<_, String>(0)?),
        queue: row.get(1)?,
        data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
        priority: row.get(3)?,
        interval: row.get::<_, i64>(4)? / 1000,
        next_at: from_ms(row.get::<_, i64>(5)?),
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        retries: row.get(7)?,
        spawned: row.get::<_, i64>(8)? as u64,
    })
}
