//! Decisions rendered by the matcher

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What the gateway does with an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Let the operation proceed
    Allow,
    /// Refuse the operation
    Deny,
    /// Hold the operation until an approver resolves it
    Approve,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Approve => "approve",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "approve" => Some(Self::Approve),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// A rule matched
    Rule,
    /// No rule matched; the kind default applied
    Default,
    /// No rule matched a protected (credential) path
    ProtectedPath,
    /// Non-overridable filesystem floor
    Floor,
    /// Evaluation failed and closed to deny
    InternalError,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Default => "default",
            Self::ProtectedPath => "protected_path",
            Self::Floor => "floor",
            Self::InternalError => "internal_error",
        }
    }
}

/// Effective outcome of an approval nobody answered in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutFallback {
    #[default]
    Deny,
    Allow,
}

impl TimeoutFallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Allow => "allow",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "deny" => Some(Self::Deny),
            "allow" => Some(Self::Allow),
            _ => None,
        }
    }
}

/// Result of evaluating one operation against one RuleSet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,

    pub reason: Reason,

    /// Name of the rule that matched, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,

    /// Message shown to the agent or the approver
    #[serde(default)]
    pub message: String,

    /// Approval timeout when the rule names one
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub on_timeout: TimeoutFallback,

    /// Version of the RuleSet that produced this decision
    #[serde(default)]
    pub ruleset_version: u64,
}

impl Decision {
    pub fn new(action: Action, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            action,
            reason,
            matched_rule: None,
            message: message.into(),
            timeout: None,
            on_timeout: TimeoutFallback::Deny,
            ruleset_version: 0,
        }
    }

    /// Deny produced when evaluation itself failed
    pub fn fail_closed(message: impl Into<String>, ruleset_version: u64) -> Self {
        Self {
            ruleset_version,
            ..Self::new(Action::Deny, Reason::InternalError, message)
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == Action::Allow
    }

    pub fn is_deny(&self) -> bool {
        self.action == Action::Deny
    }

    pub fn needs_approval(&self) -> bool {
        self.action == Action::Approve
    }

    /// Text shown to the agent when the operation is refused. Never carries
    /// more than the rule name and its message.
    pub fn denial_signal(&self) -> String {
        let message = if self.message.is_empty() {
            "operation not permitted"
        } else {
            self.message.as_str()
        };
        match (&self.matched_rule, self.reason) {
            (Some(rule), _) => format!("blocked by policy rule '{}': {}", rule, message),
            (None, Reason::Floor) => format!("blocked by filesystem floor: {}", message),
            (None, Reason::InternalError) => "blocked by policy: internal error".to_string(),
            (None, _) => format!("blocked by default policy: {}", message),
        }
    }
}

mod opt_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
