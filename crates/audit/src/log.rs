//! Write-ahead audit log
//!
//! `record` returns only after the event is durable somewhere: the database
//! when it accepts the write, the spill file when it does not. Callers report
//! the operation's outcome after `record` returns.

use crate::event::AuditEvent;
use crate::query::{AuditQuery, AuditStats};
use crate::spool::Spool;
use crate::store::{AuditStore, StorageError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where an event ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Written to the database
    Stored,
    /// Database refused the write; event is in the spill file
    Spilled,
    /// Neither the database nor the spill accepted the event
    Lost,
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Lost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Spilled => "spilled",
            Self::Lost => "lost",
        }
    }
}

pub struct AuditLog {
    store: Arc<AuditStore>,
    spool: Arc<Spool>,
    degraded: AtomicBool,
    write_failures: AtomicU64,
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

impl AuditLog {
    pub fn new(store: AuditStore, spool: Spool) -> Self {
        // Leftovers from a previous run mean the last writes never reached the store
        let degraded = !spool.is_empty();
        if degraded {
            warn!(path = %spool.path().display(), "audit spill present; replaying on next write");
        }
        Self {
            store: Arc::new(store),
            spool: Arc::new(spool),
            degraded: AtomicBool::new(degraded),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    /// True while events are going to the spill instead of the store
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Durably record one event
    pub async fn record(&self, event: &AuditEvent) -> Durability {
        let store = self.store.clone();
        let owned = event.clone();
        match blocking(move || store.record(&owned)).await {
            Ok(()) => {
                if self.is_degraded() {
                    self.recover().await;
                }
                Durability::Stored
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    error!(error = %e, "audit store write failed; audit degraded");
                }

                let spool = self.spool.clone();
                let owned = event.clone();
                let spilled = tokio::task::spawn_blocking(move || spool.append(&owned)).await;
                match spilled {
                    Ok(Ok(())) => {
                        warn!(event = %event.id, session = %event.session_id(), "audit event spilled");
                        Durability::Spilled
                    }
                    Ok(Err(e)) => {
                        error!(event = %event.id, error = %e, "audit spill failed; event lost");
                        Durability::Lost
                    }
                    Err(e) => {
                        error!(event = %event.id, error = %e, "audit spill task failed; event lost");
                        Durability::Lost
                    }
                }
            }
        }
    }

    /// Replay the spill into the store and clear the degraded flag
    async fn recover(&self) {
        let store = self.store.clone();
        let spool = self.spool.clone();
        let replayed = blocking(move || spool.drain(|events| store.import(events))).await;

        match replayed {
            Ok(n) => {
                self.degraded.store(false, Ordering::SeqCst);
                info!(replayed = n, "audit store recovered");
            }
            Err(e) => warn!(error = %e, "audit spill replay failed; staying degraded"),
        }
    }

    /// Stored events plus any still waiting in the spill, newest first
    pub async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEvent>, StorageError> {
        let store = self.store.clone();
        let spool = self.spool.clone();
        let degraded = self.is_degraded();
        blocking(move || {
            let mut events = match store.query(&query) {
                Ok(events) => events,
                // The spill is all there is while the store is broken
                Err(e) if degraded => {
                    warn!(error = %e, "audit store unreadable; answering from the spill");
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            if degraded {
                let seen: HashSet<Uuid> = events.iter().map(|e| e.id).collect();
                events.extend(
                    spool
                        .read_all()?
                        .into_iter()
                        .filter(|e| !seen.contains(&e.id) && query.matches(e)),
                );
                events.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
                if let Some(limit) = query.limit {
                    events.truncate(limit);
                }
            }
            Ok(events)
        })
        .await
    }

    pub async fn stats(&self, since: Option<chrono::DateTime<chrono::Utc>>) -> Result<AuditStats, StorageError> {
        let store = self.store.clone();
        blocking(move || store.stats(since)).await
    }

    /// Retention sweep; `protected` holds ids of still-pending approvals and their operations
    pub async fn sweep(&self, retention_days: u32, protected: HashSet<String>) -> Result<usize, StorageError> {
        let store = self.store.clone();
        let removed = blocking(move || store.sweep(retention_days, &protected)).await?;
        if removed > 0 {
            info!(removed, retention_days, "audit retention sweep");
        }
        Ok(removed)
    }
}
