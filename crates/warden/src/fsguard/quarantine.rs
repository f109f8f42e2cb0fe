//! Soft-delete quarantine
//!
//! Deleted paths are moved under `<root>/<session>/<id>/<name>` and indexed
//! in `<root>/quarantine.db`. Content stays recoverable until restored or
//! purged.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("{0} does not exist")]
    Missing(PathBuf),

    #[error("failed to move {path} into quarantine: {source}")]
    Move {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to restore {path}: {source}")]
    Restore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} already exists; restore with overwrite to replace it")]
    Conflict(PathBuf),

    #[error("no quarantine entry {0}")]
    NotFound(Uuid),

    #[error("quarantine index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("quarantine i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One soft-deleted file or directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: Uuid,
    pub original_path: PathBuf,
    pub quarantine_path: PathBuf,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by_session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    pub size: u64,
    pub is_dir: bool,
}

pub struct Quarantine {
    root: PathBuf,
    conn: Mutex<Connection>,
}

const COLUMNS: &str = "id, original_path, quarantine_path, deleted_at, session_id, operation_id, size, is_dir";

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QuarantineEntry> {
    Ok(QuarantineEntry {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        original_path: PathBuf::from(row.get::<_, String>(1)?),
        quarantine_path: PathBuf::from(row.get::<_, String>(2)?),
        deleted_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(3)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        deleted_by_session: row.get(4)?,
        operation_id: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        size: row.get::<_, i64>(6)? as u64,
        is_dir: row.get(7)?,
    })
}

/// Session ids become directory names
fn session_dir(session: &str) -> String {
    let cleaned: String = session
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

impl Quarantine {
    /// Create or open the quarantine area
    pub fn open(root: &Path) -> Result<Self, QuarantineError> {
        fs::create_dir_all(root)?;
        let conn = Connection::open(root.join("quarantine.db"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                original_path TEXT NOT NULL,
                quarantine_path TEXT NOT NULL,
                deleted_at TEXT NOT NULL,
                session_id TEXT NOT NULL,
                operation_id TEXT,
                size INTEGER NOT NULL,
                is_dir INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_path ON entries(original_path, deleted_at DESC);
            CREATE INDEX IF NOT EXISTS idx_entries_session ON entries(session_id);
            "#,
        )?;
        Ok(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move a path into quarantine. On failure the original is left in place.
    pub fn move_in(
        &self,
        path: &Path,
        session: &str,
        operation_id: Option<Uuid>,
    ) -> Result<QuarantineEntry, QuarantineError> {
        let meta = fs::symlink_metadata(path).map_err(|_| QuarantineError::Missing(path.to_path_buf()))?;
        let id = Uuid::new_v4();
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "root".into());
        let dest = self.root.join(session_dir(session)).join(id.to_string()).join(name);

        let size = move_path(path, &dest).map_err(|source| {
            // Drop the empty holder directory
            if let Some(holder) = dest.parent() {
                let _ = fs::remove_dir_all(holder);
            }
            QuarantineError::Move {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let entry = QuarantineEntry {
            id,
            original_path: path.to_path_buf(),
            quarantine_path: dest,
            deleted_at: Utc::now(),
            deleted_by_session: session.to_string(),
            operation_id,
            size,
            is_dir: meta.is_dir(),
        };

        let indexed = self.lock().execute(
            &format!("INSERT INTO entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)", COLUMNS),
            params![
                entry.id.to_string(),
                entry.original_path.to_string_lossy().to_string(),
                entry.quarantine_path.to_string_lossy().to_string(),
                ts(&entry.deleted_at),
                entry.deleted_by_session,
                entry.operation_id.map(|id| id.to_string()),
                entry.size as i64,
                entry.is_dir,
            ],
        );
        if let Err(e) = indexed {
            // Unindexed content would be unrecoverable; put it back
            warn!(path = %path.display(), error = %e, "quarantine index failed, restoring original");
            let _ = move_path(&entry.quarantine_path, path);
            if let Some(holder) = entry.quarantine_path.parent() {
                let _ = fs::remove_dir_all(holder);
            }
            return Err(e.into());
        }

        info!(
            path = %entry.original_path.display(),
            session = %entry.deleted_by_session,
            id = %entry.id,
            size = entry.size,
            "moved to quarantine"
        );
        Ok(entry)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>, QuarantineError> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?", COLUMNS),
                params![id.to_string()],
                entry_from_row,
            )
            .optional()?)
    }

    /// Entries, newest first, optionally for one session
    pub fn list(&self, session: Option<&str>) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let conn = self.lock();
        let mut entries = Vec::new();
        match session {
            Some(session) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM entries WHERE session_id = ? ORDER BY deleted_at DESC",
                    COLUMNS
                ))?;
                for row in stmt.query_map(params![session], entry_from_row)? {
                    entries.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!("SELECT {} FROM entries ORDER BY deleted_at DESC", COLUMNS))?;
                for row in stmt.query_map([], entry_from_row)? {
                    entries.push(row?);
                }
            }
        }
        Ok(entries)
    }

    /// Entries that came from `path`, newest first
    pub fn find_by_path(&self, path: &Path) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entries WHERE original_path = ? ORDER BY deleted_at DESC",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![path.to_string_lossy().to_string()], entry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Move an entry back to its original path
    pub fn restore(&self, id: Uuid, overwrite: bool) -> Result<QuarantineEntry, QuarantineError> {
        let entry = self.get(id)?.ok_or(QuarantineError::NotFound(id))?;
        let target = &entry.original_path;

        if fs::symlink_metadata(target).is_ok() {
            if !overwrite {
                return Err(QuarantineError::Conflict(target.clone()));
            }
            remove_any(target).map_err(|source| QuarantineError::Restore {
                path: target.clone(),
                source,
            })?;
        }

        move_path(&entry.quarantine_path, target).map_err(|source| QuarantineError::Restore {
            path: target.clone(),
            source,
        })?;

        self.lock()
            .execute("DELETE FROM entries WHERE id = ?", params![id.to_string()])?;
        if let Some(holder) = entry.quarantine_path.parent() {
            let _ = fs::remove_dir_all(holder);
        }

        info!(path = %target.display(), id = %id, "restored from quarantine");
        Ok(entry)
    }

    /// Permanently remove entries older than `older_than`
    pub fn purge(&self, older_than: Duration) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let age = ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::days(36500));
        let cutoff = ts(&(Utc::now() - age));

        let expired: Vec<QuarantineEntry> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!("SELECT {} FROM entries WHERE deleted_at < ?", COLUMNS))?;
            let rows = stmt.query_map(params![cutoff], entry_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut purged = Vec::new();
        for entry in expired {
            if let Some(holder) = entry.quarantine_path.parent() {
                if let Err(e) = fs::remove_dir_all(holder) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(id = %entry.id, error = %e, "failed to purge quarantine entry");
                        continue;
                    }
                }
            }
            self.lock()
                .execute("DELETE FROM entries WHERE id = ?", params![entry.id.to_string()])?;
            purged.push(entry);
        }
        Ok(purged)
    }
}

/// Move `src` to `dst`. Same filesystem: rename. Across devices: copy,
/// verify the byte count, then remove the original.
fn move_path(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(src, dst) {
        Ok(()) => tree_size(dst),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => copy_verify_remove(src, dst),
        Err(e) => Err(e),
    }
}

fn copy_verify_remove(src: &Path, dst: &Path) -> io::Result<u64> {
    let expected = tree_size(src)?;
    if let Err(e) = copy_tree(src, dst) {
        let _ = remove_any(dst);
        return Err(e);
    }

    let copied = tree_size(dst)?;
    if copied != expected {
        let _ = remove_any(dst);
        return Err(io::Error::other(format!(
            "copy of {} is incomplete ({} of {} bytes)",
            src.display(),
            copied,
            expected
        )));
    }

    if let Err(e) = remove_any(src) {
        let _ = remove_any(dst);
        return Err(e);
    }
    Ok(copied)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        return copy_one(src, dst, &meta);
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_one(entry.path(), &target, &meta)?;
        }
    }
    Ok(())
}

fn copy_one(src: &Path, dst: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Total bytes of regular files under a path
fn tree_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }
    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let meta = entry.path().symlink_metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
