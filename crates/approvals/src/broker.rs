//! The approval broker
//!
//! Owns every ApprovalRequest for its lifetime. Each request carries a
//! `watch` channel; waiters park on that channel (plus the deadline and the
//! session's cancellation token), never on the broker lock.

use crate::request::{ApprovalOutcome, ApprovalRequest, ApprovalState, Resolution};
use chrono::Utc;
use policy::{Decision, OperationDescriptor, TimeoutFallback};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long resolved requests stay inspectable
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Longest wait a request may ask for
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(Uuid),

    #[error("approval request {id} is already {state}")]
    AlreadyResolved { id: Uuid, state: ApprovalState },
}

struct Entry {
    request: ApprovalRequest,
    deadline: Instant,
    outcome: Option<ApprovalOutcome>,
    notify: watch::Sender<ApprovalState>,
}

/// Manages outstanding approval requests
pub struct ApprovalBroker {
    entries: Mutex<HashMap<Uuid, Entry>>,
    default_timeout: Duration,
    retention: Duration,
}

impl ApprovalBroker {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_timeout,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a pending request for an operation the matcher sent to approval
    pub fn request(&self, operation: &OperationDescriptor, decision: &Decision) -> ApprovalRequest {
        let timeout = decision.timeout.unwrap_or(self.default_timeout).min(MAX_TIMEOUT);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(7));

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            operation: operation.clone(),
            rule: decision.matched_rule.clone(),
            message: decision.message.clone(),
            created_at: now,
            timeout_secs: timeout.as_secs(),
            expires_at,
            on_timeout: decision.on_timeout,
            state: ApprovalState::Pending,
            resolved_at: None,
            resolved_by: None,
            note: None,
        };

        let (notify, _) = watch::channel(ApprovalState::Pending);
        self.lock().insert(
            request.id,
            Entry {
                request: request.clone(),
                deadline: Instant::now() + timeout,
                outcome: None,
                notify,
            },
        );

        info!(
            approval = %request.id,
            session = %operation.session_id,
            kind = %operation.kind(),
            rule = request.rule.as_deref().unwrap_or("-"),
            timeout_secs = request.timeout_secs,
            "approval requested: {}",
            operation.target.summary()
        );
        request
    }

    /// Resolve a pending request. Fails for unknown or already-resolved ids.
    pub fn resolve(
        &self,
        id: Uuid,
        resolution: Resolution,
        approver: &str,
        note: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;
        if entry.request.state.is_terminal() {
            return Err(ApprovalError::AlreadyResolved {
                id,
                state: entry.request.state,
            });
        }

        entry.request.finish(resolution, approver, note);
        entry.outcome = Some(ApprovalOutcome::from_resolution(resolution));
        entry.notify.send_replace(entry.request.state);

        info!(
            approval = %id,
            state = %entry.request.state,
            approver,
            "approval resolved"
        );
        Ok(entry.request.clone())
    }

    /// Wait until the request is resolved, its deadline passes, or `cancel`
    /// fires. Expiry and cancellation resolve the request to `expired`.
    pub async fn await_resolution(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let (mut rx, deadline) = {
            let entries = self.lock();
            let entry = entries.get(&id).ok_or(ApprovalError::NotFound(id))?;
            if let Some(outcome) = entry.outcome {
                return Ok(outcome);
            }
            (entry.notify.subscribe(), entry.deadline)
        };

        tokio::select! {
            changed = rx.wait_for(|state| state.is_terminal()) => {
                if changed.is_err() {
                    debug!(approval = %id, "approval entry dropped while waiting");
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.expire(id, "timeout");
            }
            _ = cancel.cancelled() => {
                self.expire(id, "session-end");
            }
        }

        self.lock()
            .get(&id)
            .and_then(|e| e.outcome)
            .ok_or(ApprovalError::NotFound(id))
    }

    /// Expire a request if it is still pending
    fn expire(&self, id: Uuid, cause: &str) -> Option<ApprovalRequest> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        if entry.request.state.is_terminal() {
            return None;
        }

        let outcome = if cause == "timeout" {
            ApprovalOutcome::TimedOut {
                allowed: entry.request.on_timeout == TimeoutFallback::Allow,
            }
        } else {
            ApprovalOutcome::Cancelled
        };
        entry.request.expire(cause);
        entry.outcome = Some(outcome);
        entry.notify.send_replace(ApprovalState::Expired);

        warn!(
            approval = %id,
            session = %entry.request.operation.session_id,
            cause,
            allowed = outcome.allowed(),
            "approval expired"
        );
        Some(entry.request.clone())
    }

    /// Expire every pending request of a session
    pub fn cancel_session(&self, session_id: &str) -> Vec<ApprovalRequest> {
        let ids: Vec<Uuid> = self
            .lock()
            .values()
            .filter(|e| e.request.is_pending() && e.request.operation.session_id == session_id)
            .map(|e| e.request.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.expire(id, "session-end"))
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.lock().get(&id).map(|e| e.request.clone())
    }

    /// Outcome of a resolved request
    pub fn outcome(&self, id: Uuid) -> Option<ApprovalOutcome> {
        self.lock().get(&id).and_then(|e| e.outcome)
    }

    /// Pending requests, oldest first
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut list: Vec<ApprovalRequest> = self
            .lock()
            .values()
            .filter(|e| e.request.is_pending())
            .map(|e| e.request.clone())
            .collect();
        list.sort_by_key(|r| r.created_at);
        list
    }

    /// Every request still held, oldest first
    pub fn all(&self) -> Vec<ApprovalRequest> {
        let mut list: Vec<ApprovalRequest> = self.lock().values().map(|e| e.request.clone()).collect();
        list.sort_by_key(|r| r.created_at);
        list
    }

    pub fn pending_count(&self) -> usize {
        self.lock().values().filter(|e| e.request.is_pending()).count()
    }

    /// Approval ids and operation ids of pending requests. The audit sweep
    /// must not remove events that reference these.
    pub fn pending_refs(&self) -> HashSet<String> {
        let mut refs = HashSet::new();
        for entry in self.lock().values().filter(|e| e.request.is_pending()) {
            refs.insert(entry.request.id.to_string());
            refs.insert(entry.request.operation.id.to_string());
        }
        refs
    }

    /// Drop resolved requests older than the retention window
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| match e.request.resolved_at {
            Some(at) => at > cutoff,
            None => true,
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::{Action, Reason, Target};
    use std::sync::Arc;

    fn operation(session: &str) -> OperationDescriptor {
        OperationDescriptor::new(session, "agent", Target::command("curl", &["https://example.org"]))
    }

    fn approve(timeout: Duration, on_timeout: TimeoutFallback) -> Decision {
        let mut decision = Decision::new(Action::Approve, Reason::Rule, "needs a human");
        decision.matched_rule = Some("ask".to_string());
        decision.timeout = Some(timeout);
        decision.on_timeout = on_timeout;
        decision
    }

    #[tokio::test]
    async fn test_grant_wakes_waiter() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(60)));
        let request = broker.request(&operation("s1"), &approve(Duration::from_secs(30), TimeoutFallback::Deny));
        let id = request.id;

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.await_resolution(id, &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resolved = broker.resolve(id, Resolution::Grant, "alice", None).unwrap();
        assert_eq!(resolved.state, ApprovalState::Granted);

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, ApprovalOutcome::Granted);
        assert!(outcome.allowed());
    }

    #[tokio::test]
    async fn test_timeout_denies_by_default() {
        let broker = ApprovalBroker::new(Duration::from_secs(60));
        let request = broker.request(&operation("s1"), &approve(Duration::from_millis(50), TimeoutFallback::Deny));

        let outcome = broker
            .await_resolution(request.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::TimedOut { allowed: false });
        let stored = broker.get(request.id).unwrap();
        assert_eq!(stored.state, ApprovalState::Expired);
        assert_eq!(stored.resolved_by.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_timeout_fallback_allow() {
        let broker = ApprovalBroker::new(Duration::from_secs(60));
        let request = broker.request(&operation("s1"), &approve(Duration::from_millis(30), TimeoutFallback::Allow));
        let outcome = broker
            .await_resolution(request.id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.allowed());
        assert_eq!(broker.get(request.id).unwrap().state, ApprovalState::Expired);
    }

    #[tokio::test]
    async fn test_resolve_twice_fails() {
        let broker = ApprovalBroker::new(Duration::from_secs(60));
        let request = broker.request(&operation("s1"), &approve(Duration::from_secs(30), TimeoutFallback::Deny));
        broker.resolve(request.id, Resolution::Deny, "bob", Some("no".into())).unwrap();

        let err = broker.resolve(request.id, Resolution::Grant, "eve", None).unwrap_err();
        assert_eq!(
            err,
            ApprovalError::AlreadyResolved {
                id: request.id,
                state: ApprovalState::Denied
            }
        );
        let unknown = Uuid::new_v4();
        assert_eq!(
            broker.resolve(unknown, Resolution::Grant, "eve", None).unwrap_err(),
            ApprovalError::NotFound(unknown)
        );
    }

    #[tokio::test]
    async fn test_late_resolve_after_timeout_is_rejected() {
        let broker = ApprovalBroker::new(Duration::from_secs(60));
        let request = broker.request(&operation("s1"), &approve(Duration::from_millis(20), TimeoutFallback::Deny));
        broker
            .await_resolution(request.id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            broker.resolve(request.id, Resolution::Grant, "alice", None),
            Err(ApprovalError::AlreadyResolved { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_expires_request() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(60)));
        let request = broker.request(&operation("s1"), &approve(Duration::from_secs(30), TimeoutFallback::Allow));
        let token = CancellationToken::new();

        let waiter = {
            let broker = Arc::clone(&broker);
            let token = token.clone();
            let id = request.id;
            tokio::spawn(async move { broker.await_resolution(id, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, ApprovalOutcome::Cancelled);
        assert!(!outcome.allowed());
    }

    #[tokio::test]
    async fn test_cancel_session_only_touches_that_session() {
        let broker = ApprovalBroker::new(Duration::from_secs(60));
        let decision = approve(Duration::from_secs(30), TimeoutFallback::Deny);
        let a = broker.request(&operation("s1"), &decision);
        let b = broker.request(&operation("s2"), &decision);

        let cancelled = broker.cancel_session("s1");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a.id);
        assert_eq!(broker.get(a.id).unwrap().state, ApprovalState::Expired);
        assert_eq!(broker.outcome(a.id), Some(ApprovalOutcome::Cancelled));

        let pending = broker.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn test_wait_does_not_block_unrelated_requests() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(60)));
        let decision = approve(Duration::from_secs(30), TimeoutFallback::Deny);
        let slow = broker.request(&operation("s1"), &decision);
        let fast = broker.request(&operation("s2"), &decision);

        let slow_waiter = {
            let broker = Arc::clone(&broker);
            let id = slow.id;
            tokio::spawn(async move { broker.await_resolution(id, &CancellationToken::new()).await })
        };

        broker.resolve(fast.id, Resolution::Grant, "alice", None).unwrap();
        let outcome = broker
            .await_resolution(fast.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Granted);
        assert!(!slow_waiter.is_finished());

        broker.resolve(slow.id, Resolution::Deny, "alice", None).unwrap();
        assert_eq!(slow_waiter.await.unwrap().unwrap(), ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn test_pending_refs_and_prune() {
        let broker = ApprovalBroker::new(Duration::from_secs(60)).with_retention(Duration::from_millis(0));
        let decision = approve(Duration::from_secs(30), TimeoutFallback::Deny);
        let open = broker.request(&operation("s1"), &decision);
        let done = broker.request(&operation("s1"), &decision);
        broker.resolve(done.id, Resolution::Grant, "alice", None).unwrap();

        let refs = broker.pending_refs();
        assert!(refs.contains(&open.id.to_string()));
        assert!(refs.contains(&open.operation.id.to_string()));
        assert!(!refs.contains(&done.id.to_string()));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(broker.prune(), 1);
        assert!(broker.get(done.id).is_none());
        assert!(broker.get(open.id).is_some());
    }
}
