//! Agent sessions known to the gateway
//!
//! Each session owns a cancellation token. Ending the session fires it, which
//! wakes every approval wait of that session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Session name used when the caller does not identify itself
pub const ANONYMOUS: &str = "anonymous";

/// Sessions with no operation for this long are forgotten by the sweep
pub const IDLE_AFTER: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub operations: u64,
}

struct Session {
    info: SessionInfo,
    token: CancellationToken,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancellation token for a session, registering it on first use
    pub fn token(&self, session_id: &str) -> CancellationToken {
        let mut sessions = self.lock();
        let now = Utc::now();
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| Session {
            info: SessionInfo {
                id: session_id.to_string(),
                started_at: now,
                last_seen: now,
                operations: 0,
            },
            token: CancellationToken::new(),
        });
        session.info.operations += 1;
        session.info.last_seen = now;
        session.token.clone()
    }

    /// Forget a session and cancel its waits. Returns false for unknown ids.
    pub fn end(&self, session_id: &str) -> bool {
        match self.lock().remove(session_id) {
            Some(session) => {
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget sessions with no operation for `idle`, except those in `busy`
    /// (sessions still waiting on an approval). Returns how many went.
    pub fn prune_idle(&self, idle: Duration, busy: &HashSet<String>) -> usize {
        let idle = chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::days(36500));
        let cutoff = Utc::now() - idle;
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, s| busy.contains(id) || s.info.last_seen > cutoff);
        before - sessions.len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.lock().values().map(|s| s.info.clone()).collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_cancels_token() {
        let registry = SessionRegistry::new();
        let token = registry.token("s1");
        let again = registry.token("s1");
        assert_eq!(registry.list()[0].operations, 2);

        assert!(registry.end("s1"));
        assert!(token.is_cancelled());
        assert!(again.is_cancelled());
        assert!(!registry.end("s1"));

        // A new operation after teardown starts a fresh session
        assert!(!registry.token("s1").is_cancelled());
    }

    #[test]
    fn test_prune_idle_keeps_busy_sessions() {
        let registry = SessionRegistry::new();
        registry.token("idle");
        registry.token("waiting");
        registry.token("fresh");

        assert_eq!(registry.prune_idle(Duration::from_secs(3600), &HashSet::new()), 0);

        let busy: HashSet<String> = ["waiting".to_string()].into_iter().collect();
        std::thread::sleep(Duration::from_millis(20));
        registry.token("fresh");
        assert_eq!(registry.prune_idle(Duration::from_millis(10), &busy), 1);

        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert!(ids.contains(&"waiting".to_string()));
        assert!(ids.contains(&"fresh".to_string()));
        assert!(!ids.contains(&"idle".to_string()));
    }
}
