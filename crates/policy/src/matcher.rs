//! The matcher
//!
//! Pure evaluation of one descriptor against one RuleSet. No I/O, no
//! state: safe to call from any number of tasks against a shared snapshot.

use crate::decision::{Action, Decision, Reason};
use crate::error::MatchError;
use crate::operation::{OperationDescriptor, OperationKind, Target};
use crate::ruleset::RuleSet;

/// Evaluate a descriptor. Errors close to deny.
pub fn evaluate(descriptor: &OperationDescriptor, ruleset: &RuleSet) -> Decision {
    match try_evaluate(descriptor, ruleset) {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(
                operation = %descriptor.id,
                kind = %descriptor.kind(),
                error = %e,
                "policy evaluation failed, denying"
            );
            Decision::fail_closed(e.to_string(), ruleset.version)
        }
    }
}

/// Evaluate a descriptor, surfacing evaluation errors
pub fn try_evaluate(descriptor: &OperationDescriptor, ruleset: &RuleSet) -> Result<Decision, MatchError> {
    let kind = descriptor.kind();
    if kind == OperationKind::Control {
        return Err(MatchError::UnsupportedKind(kind));
    }

    for rule in ruleset.rules_for(kind) {
        if rule.criteria.matches(&rule.name, &descriptor.target)? {
            return Ok(rule.decision(ruleset.version));
        }
    }

    Ok(default_decision(&descriptor.target, ruleset))
}

fn default_decision(target: &Target, ruleset: &RuleSet) -> Decision {
    let defaults = &ruleset.defaults;
    let (action, reason, message) = match target {
        Target::File { path, .. } if ruleset.is_protected(path) => (
            defaults.protected_file,
            Reason::ProtectedPath,
            "protected credential path",
        ),
        Target::Network { .. } => (
            defaults.network,
            Reason::Default,
            "destination is not listed in any network rule",
        ),
        other => (defaults.for_kind(other.kind()), Reason::Default, "no rule matched"),
    };

    let mut decision = Decision::new(action, reason, message);
    decision.ruleset_version = ruleset.version;
    if action == Action::Approve {
        decision.timeout = defaults.approval_timeout;
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::load;
    use crate::operation::{FileOp, Transport};
    use std::path::PathBuf;

    fn command(program: &str, args: &[&str]) -> OperationDescriptor {
        OperationDescriptor::new("s1", "agent", Target::command(program, args))
    }

    fn network(host: &str, port: u16) -> OperationDescriptor {
        OperationDescriptor::new("s1", "agent", Target::network(host, port, Transport::Https))
    }

    #[test]
    fn test_first_match_wins_in_both_orders() {
        let deny_first = load(
            "network_rules:\n  - name: deny-lan\n    cidrs: [10.0.0.0/8]\n    decision: deny\n  - name: allow-all\n    domains: ['*']\n    decision: allow\n",
        )
        .unwrap();
        let allow_first = load(
            "network_rules:\n  - name: allow-all\n    domains: ['*']\n    decision: allow\n  - name: deny-lan\n    cidrs: [10.0.0.0/8]\n    decision: deny\n",
        )
        .unwrap();

        let op = network("10.1.2.3", 443);
        let a = evaluate(&op, &deny_first);
        assert_eq!(a.action, Action::Deny);
        assert_eq!(a.matched_rule.as_deref(), Some("deny-lan"));

        let b = evaluate(&op, &allow_first);
        assert_eq!(b.action, Action::Allow);
        assert_eq!(b.matched_rule.as_deref(), Some("allow-all"));
    }

    #[test]
    fn test_ipv4_mapped_address_matches_ipv4_cidr() {
        let set = load(
            "network_rules:\n  - name: deny-lan\n    cidrs: [10.0.0.0/8]\n    decision: deny\n  - name: allow-all\n    domains: ['*']\n    decision: allow\n",
        )
        .unwrap();

        for host in ["::ffff:10.0.0.1", "[::ffff:10.0.0.1]", "::ffff:a00:1"] {
            let decision = evaluate(&network(host, 443), &set);
            assert_eq!(decision.action, Action::Deny, "{}", host);
            assert_eq!(decision.matched_rule.as_deref(), Some("deny-lan"));
        }
    }

    #[test]
    fn test_unlisted_destination_needs_approval() {
        let set = load("version: 1\n").unwrap();
        let decision = evaluate(&network("example.org", 443), &set);
        assert_eq!(decision.action, Action::Approve);
        assert_eq!(decision.reason, Reason::Default);
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn test_empty_lists_use_configured_defaults() {
        let strict = load("version: 1\n").unwrap();
        assert_eq!(evaluate(&command("ls", &[]), &strict).action, Action::Deny);

        let relaxed = load("defaults:\n  command: allow\n  file: allow\n").unwrap();
        assert_eq!(evaluate(&command("ls", &[]), &relaxed).action, Action::Allow);
        let file = OperationDescriptor::new("s1", "agent", Target::file("/work/a.txt", FileOp::Write));
        assert_eq!(evaluate(&file, &relaxed).action, Action::Allow);
    }

    #[test]
    fn test_protected_path_default() {
        let set = load("defaults:\n  file: allow\n").unwrap();
        let key = PathBuf::from(shellexpand::tilde("~/.aws/credentials").to_string());
        let op = OperationDescriptor::new("s1", "agent", Target::file(&key, FileOp::Read));
        let decision = evaluate(&op, &set);
        assert_eq!(decision.action, Action::Approve);
        assert_eq!(decision.reason, Reason::ProtectedPath);
    }

    #[test]
    fn test_explicit_rule_beats_protected_default() {
        let set = load("file_rules:\n  - name: aws-ok\n    paths: ['~/.aws/**']\n    decision: allow\n").unwrap();
        let key = PathBuf::from(shellexpand::tilde("~/.aws/config").to_string());
        let op = OperationDescriptor::new("s1", "agent", Target::file(&key, FileOp::Read));
        assert_eq!(evaluate(&op, &set).action, Action::Allow);
    }

    #[test]
    fn test_approval_timeout_carried() {
        let set = load(
            "defaults:\n  approval_timeout: 90s\nfile_rules:\n  - name: keys\n    paths: [/keys/**]\n    decision: approve\n    timeout: 2m\n    on_timeout: allow\n",
        )
        .unwrap();
        let op = OperationDescriptor::new("s1", "agent", Target::file("/keys/a", FileOp::Read));
        let decision = evaluate(&op, &set);
        assert_eq!(decision.timeout, Some(std::time::Duration::from_secs(120)));
        assert_eq!(decision.on_timeout, crate::decision::TimeoutFallback::Allow);

        let unlisted = evaluate(&network("example.org", 443), &set);
        assert_eq!(unlisted.timeout, Some(std::time::Duration::from_secs(90)));
    }

    #[test]
    fn test_control_operations_fail_closed() {
        let set = load("defaults:\n  command: allow\n").unwrap();
        let op = OperationDescriptor::new(
            "s1",
            "operator",
            Target::Control {
                action: "policy.reload".into(),
                detail: String::new(),
            },
        );
        assert!(try_evaluate(&op, &set).is_err());
        let decision = evaluate(&op, &set);
        assert_eq!(decision.action, Action::Deny);
        assert_eq!(decision.reason, Reason::InternalError);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let set = load(crate::DEFAULT_POLICY).unwrap();
        let op = command("rm", &["-rf", "/home"]);
        let first = evaluate(&op, &set);
        for _ in 0..10 {
            assert_eq!(evaluate(&op, &set), first);
        }
    }
}
