//! Versioned, immutable rule sets

use crate::decision::Action;
use crate::operation::OperationKind;
use crate::rule::{PathGlob, Rule};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Credential locations that default to approval even without a file rule
pub const BUILTIN_PROTECTED_PATHS: &[&str] = &[
    "~/.ssh/**",
    "~/.aws/**",
    "~/.config/gcloud/**",
    "~/.azure/**",
    "~/.kube/**",
    "~/.docker/config.json",
    "~/.git-credentials",
    "~/.netrc",
    "~/.gnupg/**",
    "**/.git/config",
];

/// Decisions applied when no rule matches
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDefaults {
    pub command: Action,
    pub file: Action,
    /// Default for files under a protected path
    pub protected_file: Action,
    /// Default for unlisted network destinations
    pub network: Action,
    /// Timeout for approvals whose rule names none
    pub approval_timeout: Option<Duration>,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            command: Action::Deny,
            file: Action::Deny,
            protected_file: Action::Approve,
            network: Action::Approve,
            approval_timeout: None,
        }
    }
}

impl PolicyDefaults {
    pub fn for_kind(&self, kind: OperationKind) -> Action {
        match kind {
            OperationKind::Command => self.command,
            OperationKind::Network => self.network,
            OperationKind::File => self.file,
            OperationKind::Control => Action::Deny,
        }
    }
}

/// One committed version of the policy. Never mutated once built; a reload
/// produces a new RuleSet.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Monotonic per store; 0 until committed
    pub version: u64,
    /// sha256 of the raw document
    pub digest: String,
    pub loaded_at: DateTime<Utc>,
    /// File the document came from, if any
    pub source: Option<PathBuf>,
    pub defaults: PolicyDefaults,
    pub protected_paths: Vec<PathGlob>,
    pub command_rules: Vec<Rule>,
    pub network_rules: Vec<Rule>,
    pub file_rules: Vec<Rule>,
}

impl RuleSet {
    /// Ordered rules for a kind
    pub fn rules_for(&self, kind: OperationKind) -> &[Rule] {
        match kind {
            OperationKind::Command => &self.command_rules,
            OperationKind::Network => &self.network_rules,
            OperationKind::File => &self.file_rules,
            OperationKind::Control => &[],
        }
    }

    /// Whether a path falls under a protected glob
    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected_paths.iter().any(|g| g.matches(path))
    }

    pub fn rule_count(&self) -> usize {
        self.command_rules.len() + self.network_rules.len() + self.file_rules.len()
    }

    /// Find a rule by kind and name
    pub fn rule(&self, kind: OperationKind, name: &str) -> Option<&Rule> {
        self.rules_for(kind).iter().find(|r| r.name == name)
    }

    /// Short digest for display
    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}
