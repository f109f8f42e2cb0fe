//! SQLite audit store
//!
//! Append-only table `events`. Searchable columns are stored alongside the
//! full JSON payload; rows are only ever removed by the retention sweep.

use crate::event::AuditEvent;
use crate::query::{AuditQuery, AuditStats};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("audit database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("audit i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit event encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("audit writer task failed: {0}")]
    Task(String),
}

/// Timestamps are stored in one fixed format so text comparison orders them
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct AuditStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl AuditStore {
    /// Create or open the database at `path`
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        Ok(store)
    }

    /// Throwaway store (offline evaluation, tests)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        if self.path.is_some() {
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                rule TEXT,
                outcome TEXT NOT NULL,
                approval_id TEXT,
                approval_state TEXT,
                duration_ms INTEGER NOT NULL,
                ruleset_version INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, recorded_at DESC);
            CREATE INDEX IF NOT EXISTS idx_events_recorded ON events(recorded_at DESC);
            CREATE INDEX IF NOT EXISTS idx_events_operation ON events(operation_id);
            "#,
        )?;
        Ok(())
    }

    /// Append one event. Returns once the row is durable.
    pub fn record(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let payload = serde_json::to_string(event)?;
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO events
            (id, recorded_at, operation_id, session_id, actor, kind, target, action, reason, rule,
             outcome, approval_id, approval_state, duration_ms, ruleset_version, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                event.id.to_string(),
                ts(&event.recorded_at),
                event.operation.id.to_string(),
                event.operation.session_id,
                event.operation.actor,
                event.operation.kind().as_str(),
                event.operation.target.summary(),
                event.decision.action.as_str(),
                event.decision.reason.as_str(),
                event.decision.matched_rule,
                event.outcome.as_str(),
                event.approval_id.map(|id| id.to_string()),
                event.approval_state.map(|s| s.as_str()),
                event.duration_ms as i64,
                event.decision.ruleset_version as i64,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Insert events that may already be present (spill replay)
    pub fn import(&self, events: &[AuditEvent]) -> Result<usize, StorageError> {
        let mut imported = 0;
        for event in events {
            if self.get(event.id)?.is_some() {
                continue;
            }
            self.record(event)?;
            imported += 1;
        }
        Ok(imported)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, StorageError> {
        let payload: Option<String> = self
            .lock()
            .query_row(
                "SELECT payload FROM events WHERE id = ?",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// Events matching a filter, newest first
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, StorageError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(ref session) = query.session_id {
            clauses.push("session_id = ?");
            values.push(session.clone());
        }
        if let Some(since) = query.since {
            clauses.push("recorded_at >= ?");
            values.push(ts(&since));
        }
        if let Some(until) = query.until {
            clauses.push("recorded_at <= ?");
            values.push(ts(&until));
        }
        if let Some(kind) = query.kind {
            clauses.push("kind = ?");
            values.push(kind.as_str().to_string());
        }
        if let Some(action) = query.action {
            clauses.push("action = ?");
            values.push(action.as_str().to_string());
        }
        if let Some(outcome) = query.outcome {
            clauses.push("outcome = ?");
            values.push(outcome.as_str().to_string());
        }
        if let Some(ref rule) = query.rule {
            clauses.push("rule = ?");
            values.push(rule.clone());
        }

        let mut sql = String::from("SELECT payload FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY recorded_at DESC, rowid DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            match serde_json::from_str::<AuditEvent>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable audit row"),
            }
        }
        Ok(events)
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let n: i64 = self.lock().query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Remove events older than the retention window, keeping any event an
    /// unresolved approval still refers to. Returns the number removed.
    pub fn sweep(&self, retention_days: u32, protected: &HashSet<String>) -> Result<usize, StorageError> {
        let cutoff = ts(&(Utc::now() - Duration::days(retention_days as i64)));
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let expired: Vec<(String, String, Option<String>)> = {
            let mut stmt = tx.prepare("SELECT id, operation_id, approval_id FROM events WHERE recorded_at < ?")?;
            let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut removed = 0;
        for (id, operation_id, approval_id) in expired {
            let held = protected.contains(&id)
                || protected.contains(&operation_id)
                || approval_id.map(|a| protected.contains(&a)).unwrap_or(false);
            if held {
                continue;
            }
            removed += tx.execute("DELETE FROM events WHERE id = ?", params![id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Totals per outcome, action and approval state
    pub fn stats(&self, since: Option<DateTime<Utc>>) -> Result<AuditStats, StorageError> {
        let mut query = AuditQuery::default();
        if let Some(since) = since {
            query = query.since(since);
        }
        let mut stats = AuditStats::default();
        for event in self.query(&query)? {
            stats.add(&event);
        }
        Ok(stats)
    }
}
