//! Audit events

use approvals::ApprovalState;
use chrono::{DateTime, Utc};
use policy::{Decision, OperationDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What finally happened to the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allowed,
    Denied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "allowed" | "allow" => Some(Self::Allowed),
            "denied" | "deny" => Some(Self::Denied),
            _ => None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        *self == Self::Allowed
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable record of a decision and its final outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,

    /// When the final outcome was known
    pub recorded_at: DateTime<Utc>,

    pub operation: OperationDescriptor,

    pub decision: Decision,

    /// Approval request the operation waited on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_state: Option<ApprovalState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    pub outcome: Outcome,

    /// From interception to final outcome
    pub duration_ms: u64,

    /// Redacted output of the operation (command.exec)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_output: Option<String>,

    /// Free-form detail (quarantine path, degraded-audit marker, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AuditEvent {
    pub fn new(operation: OperationDescriptor, decision: Decision, outcome: Outcome) -> Self {
        let duration_ms = (Utc::now() - operation.timestamp).num_milliseconds().max(0) as u64;
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            operation,
            decision,
            approval_id: None,
            approval_state: None,
            approved_by: None,
            outcome,
            duration_ms,
            captured_output: None,
            note: None,
        }
    }

    pub fn with_approval(mut self, id: Uuid, state: ApprovalState, by: Option<String>) -> Self {
        self.approval_id = Some(id);
        self.approval_state = Some(state);
        self.approved_by = by;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.captured_output = Some(output.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        let note = note.into();
        self.note = Some(match self.note.take() {
            Some(existing) => format!("{}; {}", existing, note),
            None => note,
        });
        self
    }

    pub fn session_id(&self) -> &str {
        &self.operation.session_id
    }

    /// Ids an unresolved approval could refer to
    pub fn references(&self) -> Vec<String> {
        let mut refs = vec![self.operation.id.to_string()];
        if let Some(id) = self.approval_id {
            refs.push(id.to_string());
        }
        refs
    }
}
