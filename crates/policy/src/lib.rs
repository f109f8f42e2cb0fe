//! Warden policy - rules, rule store and matcher
//!
//! A policy is three ordered rule lists (commands, network, files). An
//! intercepted operation is normalised into an [`OperationDescriptor`] and
//! evaluated against the active [`RuleSet`] snapshot: the first matching rule
//! wins, and when nothing matches the per-kind default applies.
//!
//! The [`RuleStore`] holds the active snapshot and swaps it atomically on
//! reload; evaluation never sees a half-updated rule list.

pub mod decision;
pub mod document;
pub mod error;
pub mod matcher;
pub mod operation;
pub mod rule;
pub mod ruleset;
pub mod store;

pub use decision::{Action, Decision, Reason, TimeoutFallback};
pub use document::{load, DEFAULT_POLICY};
pub use error::{MatchError, ParseErrorKind, PolicyParseError};
pub use matcher::evaluate;
pub use operation::{FileOp, OperationDescriptor, OperationKind, Target, Transport};
pub use rule::{CommandCriteria, Criteria, DomainPattern, FileCriteria, NetworkCriteria, PathGlob, Rule};
pub use ruleset::{PolicyDefaults, RuleSet};
pub use store::{ReloadOutcome, RuleStore};
