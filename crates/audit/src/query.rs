//! Audit queries and statistics

use crate::event::{AuditEvent, Outcome};
use chrono::{DateTime, Utc};
use policy::{Action, OperationKind};
use serde::{Deserialize, Serialize};

/// Filter for audit queries. Results come back newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Filter by session
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Events recorded at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Events recorded at or before `until`
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filter by matcher action
    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Filter by final outcome
    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Filter by matched rule name
    pub fn rule(mut self, rule: &str) -> Self {
        self.rule = Some(rule.to_string());
        self
    }

    /// Limit results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-memory check, used for spilled events
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref session) = self.session_id {
            if event.operation.session_id != *session {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.recorded_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.recorded_at > until {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.operation.kind() != kind {
                return false;
            }
        }
        if let Some(action) = self.action {
            if event.decision.action != action {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if event.outcome != outcome {
                return false;
            }
        }
        if let Some(ref rule) = self.rule {
            if event.decision.matched_rule.as_deref() != Some(rule.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Audit statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    /// Decisions by matcher action
    pub action_allow: usize,
    pub action_deny: usize,
    pub action_approve: usize,
    /// Approval resolutions
    pub approvals_granted: usize,
    pub approvals_denied: usize,
    pub approvals_expired: usize,
}

impl AuditStats {
    pub fn add(&mut self, event: &AuditEvent) {
        self.total += 1;
        match event.outcome {
            Outcome::Allowed => self.allowed += 1,
            Outcome::Denied => self.denied += 1,
        }
        match event.decision.action {
            Action::Allow => self.action_allow += 1,
            Action::Deny => self.action_deny += 1,
            Action::Approve => self.action_approve += 1,
        }
        match event.approval_state {
            Some(approvals::ApprovalState::Granted) => self.approvals_granted += 1,
            Some(approvals::ApprovalState::Denied) => self.approvals_denied += 1,
            Some(approvals::ApprovalState::Expired) => self.approvals_expired += 1,
            _ => {}
        }
    }

    /// Share of decisions that ended denied
    pub fn deny_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.denied as f64) / (self.total as f64) * 100.0
    }
}
