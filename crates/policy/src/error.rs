//! Policy errors

use crate::operation::OperationKind;
use std::fmt;
use thiserror::Error;

/// What was wrong with a policy document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax or shape error
    Syntax(String),
    UnknownDecision(String),
    UnknownOperation(String),
    InvalidCidr(String),
    InvalidRegex(String),
    InvalidGlob(String),
    InvalidDuration(String),
    InvalidDomain(String),
    DuplicateName,
    /// A rule with nothing to match on
    EmptyCriteria,
    /// `timeout` or `on_timeout` on a rule whose decision is not approve
    TimeoutWithoutApprove,
    UnsupportedVersion(u32),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "{}", msg),
            Self::UnknownDecision(v) => {
                write!(f, "unknown decision '{}' (expected allow, deny or approve)", v)
            }
            Self::UnknownOperation(v) => {
                write!(f, "unknown operation '{}' (expected read, write, delete or *)", v)
            }
            Self::InvalidCidr(v) => write!(f, "malformed CIDR '{}'", v),
            Self::InvalidRegex(v) => write!(f, "invalid argument pattern: {}", v),
            Self::InvalidGlob(v) => write!(f, "invalid path glob: {}", v),
            Self::InvalidDuration(v) => write!(f, "invalid duration '{}'", v),
            Self::InvalidDomain(v) => write!(f, "invalid domain pattern '{}'", v),
            Self::DuplicateName => write!(f, "duplicate rule name"),
            Self::EmptyCriteria => write!(f, "rule has no match criteria"),
            Self::TimeoutWithoutApprove => {
                write!(f, "timeout/on_timeout only apply to approve rules")
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported policy version {}", v),
        }
    }
}

/// A policy document failed to load. Reports the offending rule and line so
/// the author can find it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct PolicyParseError {
    /// Rule name, when the error is inside a rule
    pub rule: Option<String>,
    /// 1-based line, when known
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub kind: ParseErrorKind,
}

impl PolicyParseError {
    pub fn new(kind: ParseErrorKind) -> Self {
        Self {
            rule: None,
            line: None,
            column: None,
            kind,
        }
    }

    pub fn in_rule(rule: impl Into<String>, line: Option<usize>, kind: ParseErrorKind) -> Self {
        Self {
            rule: Some(rule.into()),
            line,
            column: None,
            kind,
        }
    }
}

impl fmt::Display for PolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.rule, self.line) {
            (Some(rule), Some(line)) => write!(f, "rule '{}' (line {}): {}", rule, line, self.kind),
            (Some(rule), None) => write!(f, "rule '{}': {}", rule, self.kind),
            (None, Some(line)) => match self.column {
                Some(col) => write!(f, "line {} column {}: {}", line, col, self.kind),
                None => write!(f, "line {}: {}", line, self.kind),
            },
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

/// Evaluation failed for a descriptor. Callers treat this as a deny.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("operations of kind '{0}' are not evaluated by policy")]
    UnsupportedKind(OperationKind),

    #[error("rule '{rule}' cannot match a {kind} operation")]
    CriteriaMismatch { rule: String, kind: OperationKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_rule_and_line() {
        let err = PolicyParseError::in_rule(
            "metadata",
            Some(12),
            ParseErrorKind::InvalidCidr("169.254.0.0/33".to_string()),
        );
        assert_eq!(err.to_string(), "rule 'metadata' (line 12): malformed CIDR '169.254.0.0/33'");
    }

    #[test]
    fn test_display_syntax_error() {
        let mut err = PolicyParseError::new(ParseErrorKind::Syntax("did not find expected key".into()));
        err.line = Some(3);
        err.column = Some(5);
        assert_eq!(err.to_string(), "line 3 column 5: did not find expected key");
    }
}
