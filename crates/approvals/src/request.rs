//! Approval requests and their states

use chrono::{DateTime, Utc};
use policy::{OperationDescriptor, TimeoutFallback};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state. Terminal once it leaves `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Granted,
    Denied,
    Expired,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "granted" => Some(Self::Granted),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != Self::Pending
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An approver's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Grant,
    Deny,
}

impl Resolution {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "grant" | "granted" | "approve" | "allow" => Some(Self::Grant),
            "deny" | "denied" | "reject" => Some(Self::Deny),
            _ => None,
        }
    }

    fn state(&self) -> ApprovalState {
        match self {
            Self::Grant => ApprovalState::Granted,
            Self::Deny => ApprovalState::Denied,
        }
    }
}

/// How a request ended, as seen by the waiting operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApprovalOutcome {
    Granted,
    Denied,
    /// Nobody answered in time; `allowed` follows the rule's fallback
    TimedOut { allowed: bool },
    /// The session ended while the request was pending
    Cancelled,
}

impl ApprovalOutcome {
    /// Whether the held operation may proceed
    pub fn allowed(&self) -> bool {
        match self {
            Self::Granted => true,
            Self::TimedOut { allowed } => *allowed,
            Self::Denied | Self::Cancelled => false,
        }
    }

    pub fn state(&self) -> ApprovalState {
        match self {
            Self::Granted => ApprovalState::Granted,
            Self::Denied => ApprovalState::Denied,
            Self::TimedOut { .. } | Self::Cancelled => ApprovalState::Expired,
        }
    }

    pub(crate) fn from_resolution(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Grant => Self::Granted,
            Resolution::Deny => Self::Denied,
        }
    }
}

/// A held operation waiting for an approver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,

    /// The operation being held
    pub operation: OperationDescriptor,

    /// Rule that asked for approval, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    #[serde(default)]
    pub message: String,

    pub created_at: DateTime<Utc>,

    pub timeout_secs: u64,

    pub expires_at: DateTime<Utc>,

    #[serde(default)]
    pub on_timeout: TimeoutFallback,

    pub state: ApprovalState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Approver name, or `timeout` / `session-end`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.state == ApprovalState::Pending
    }

    pub(crate) fn finish(&mut self, resolution: Resolution, by: &str, note: Option<String>) {
        self.state = resolution.state();
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(by.to_string());
        self.note = note;
    }

    pub(crate) fn expire(&mut self, by: &str) {
        self.state = ApprovalState::Expired;
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(by.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_allowed() {
        assert!(ApprovalOutcome::Granted.allowed());
        assert!(!ApprovalOutcome::Denied.allowed());
        assert!(!ApprovalOutcome::Cancelled.allowed());
        assert!(ApprovalOutcome::TimedOut { allowed: true }.allowed());
        assert_eq!(ApprovalOutcome::TimedOut { allowed: true }.state(), ApprovalState::Expired);
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::from_str("approve"), Some(Resolution::Grant));
        assert_eq!(Resolution::from_str("Deny"), Some(Resolution::Deny));
        assert_eq!(Resolution::from_str("later"), None);
    }

    #[test]
    fn test_outcome_json() {
        let json = serde_json::to_value(ApprovalOutcome::TimedOut { allowed: false }).unwrap();
        assert_eq!(json["outcome"], "timed_out");
        assert_eq!(json["allowed"], false);
    }
}
