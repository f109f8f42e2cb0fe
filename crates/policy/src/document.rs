//! Policy document parsing and validation
//!
//! Policies are YAML documents with three ordered rule lists:
//!
//! ```yaml
//! version: 1
//! defaults:
//!   command: allow
//!   network: approve
//! command_rules:
//!   - name: block-recursive-rm
//!     commands: [rm]
//!     args_patterns: ['^-[a-zA-Z]*[rR]']
//!     decision: deny
//! ```
//!
//! Every error carries the offending rule name and its line.

use crate::decision::{Action, TimeoutFallback};
use crate::error::{ParseErrorKind, PolicyParseError};
use crate::operation::{FileOp, OperationKind};
use crate::rule::{CommandCriteria, Criteria, DomainPattern, FileCriteria, NetworkCriteria, PathGlob, Rule};
use crate::ruleset::{PolicyDefaults, RuleSet, BUILTIN_PROTECTED_PATHS};
use chrono::Utc;
use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Policy shipped with warden, written by `warden init`
pub const DEFAULT_POLICY: &str = include_str!("../default-policy.yaml");

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    protected_paths: Option<Vec<String>>,
    #[serde(default)]
    command_rules: Vec<RawRule>,
    #[serde(default)]
    network_rules: Vec<RawRule>,
    #[serde(default)]
    file_rules: Vec<RawRule>,
}

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

impl Default for RawPolicy {
    fn default() -> Self {
        Self {
            version: default_version(),
            defaults: RawDefaults::default(),
            protected_paths: None,
            command_rules: Vec::new(),
            network_rules: Vec::new(),
            file_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    command: Option<String>,
    file: Option<String>,
    protected_file: Option<String>,
    network: Option<String>,
    approval_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    name: String,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    args_patterns: Vec<String>,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    cidrs: Vec<String>,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    operations: Vec<String>,
    decision: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    on_timeout: Option<String>,
}

/// Parse and validate a policy document
pub fn load(raw: &str) -> Result<RuleSet, PolicyParseError> {
    load_with_source(raw, None)
}

/// Parse a document read from `source`
pub fn load_with_source(raw: &str, source: Option<&Path>) -> Result<RuleSet, PolicyParseError> {
    let doc: RawPolicy = if is_blank(raw) {
        RawPolicy::default()
    } else {
        serde_yaml::from_str(raw).map_err(|e| syntax_error(raw, e))?
    };

    if doc.version != SUPPORTED_VERSION {
        let mut err = PolicyParseError::new(ParseErrorKind::UnsupportedVersion(doc.version));
        err.line = find_top_level_key(raw, "version");
        return Err(err);
    }

    let defaults = build_defaults(raw, &doc.defaults)?;

    let protected_paths = match &doc.protected_paths {
        Some(list) => list
            .iter()
            .map(|p| {
                PathGlob::new(p).map_err(|e| {
                    let mut err = PolicyParseError::new(ParseErrorKind::InvalidGlob(format!("{}: {}", p, e)));
                    err.line = find_top_level_key(raw, "protected_paths");
                    err
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => BUILTIN_PROTECTED_PATHS
            .iter()
            .filter_map(|p| PathGlob::new(p).ok())
            .collect(),
    };

    let command_rules = build_rules(raw, "command_rules", OperationKind::Command, &doc.command_rules)?;
    let network_rules = build_rules(raw, "network_rules", OperationKind::Network, &doc.network_rules)?;
    let file_rules = build_rules(raw, "file_rules", OperationKind::File, &doc.file_rules)?;

    Ok(RuleSet {
        version: 0,
        digest: digest(raw),
        loaded_at: Utc::now(),
        source: source.map(|p| p.to_path_buf()),
        defaults,
        protected_paths,
        command_rules,
        network_rules,
        file_rules,
    })
}

/// sha256 hex of a raw document
pub fn digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn is_blank(raw: &str) -> bool {
    raw.lines().all(|line| {
        let t = line.trim();
        t.is_empty() || t.starts_with('#') || t == "---"
    })
}

fn syntax_error(raw: &str, err: serde_yaml::Error) -> PolicyParseError {
    let mut out = PolicyParseError::new(ParseErrorKind::Syntax(err.to_string()));
    if let Some(loc) = err.location() {
        out.line = Some(loc.line());
        out.column = Some(loc.column());
        out.rule = enclosing_rule(raw, loc.line());
    }
    out
}

fn build_defaults(raw: &str, d: &RawDefaults) -> Result<PolicyDefaults, PolicyParseError> {
    let line = find_top_level_key(raw, "defaults");
    let fail = |kind: ParseErrorKind| {
        let mut err = PolicyParseError::new(kind);
        err.line = line;
        err
    };
    let action = |value: &Option<String>, fallback: Action| -> Result<Action, PolicyParseError> {
        match value {
            Some(v) => Action::from_str(v).ok_or_else(|| fail(ParseErrorKind::UnknownDecision(v.clone()))),
            None => Ok(fallback),
        }
    };

    let base = PolicyDefaults::default();
    Ok(PolicyDefaults {
        command: action(&d.command, base.command)?,
        file: action(&d.file, base.file)?,
        protected_file: action(&d.protected_file, base.protected_file)?,
        network: action(&d.network, base.network)?,
        approval_timeout: match &d.approval_timeout {
            Some(v) => Some(parse_duration(v).ok_or_else(|| fail(ParseErrorKind::InvalidDuration(v.clone())))?),
            None => None,
        },
    })
}

fn build_rules(
    raw: &str,
    section: &str,
    kind: OperationKind,
    entries: &[RawRule],
) -> Result<Vec<Rule>, PolicyParseError> {
    let lines = rule_lines(raw, section);
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let line = lines.get(i).copied();
        let fail = |kind: ParseErrorKind| PolicyParseError::in_rule(entry.name.clone(), line, kind);

        if entry.name.trim().is_empty() {
            return Err(fail(ParseErrorKind::Syntax(format!(
                "{} entry {} has an empty name",
                section,
                i + 1
            ))));
        }
        if !seen.insert(entry.name.clone()) {
            return Err(fail(ParseErrorKind::DuplicateName));
        }

        let action = Action::from_str(&entry.decision)
            .ok_or_else(|| fail(ParseErrorKind::UnknownDecision(entry.decision.clone())))?;

        if action != Action::Approve && (entry.timeout.is_some() || entry.on_timeout.is_some()) {
            return Err(fail(ParseErrorKind::TimeoutWithoutApprove));
        }
        let timeout = match &entry.timeout {
            Some(v) => Some(parse_duration(v).ok_or_else(|| fail(ParseErrorKind::InvalidDuration(v.clone())))?),
            None => None,
        };
        let on_timeout = match &entry.on_timeout {
            Some(v) => TimeoutFallback::from_str(v)
                .ok_or_else(|| fail(ParseErrorKind::UnknownDecision(v.clone())))?,
            None => TimeoutFallback::Deny,
        };

        if let Some(field) = foreign_field(kind, entry) {
            return Err(fail(ParseErrorKind::Syntax(format!(
                "'{}' does not apply to {}",
                field, section
            ))));
        }

        let criteria = match kind {
            OperationKind::Command => Criteria::Command(command_criteria(entry).map_err(fail)?),
            OperationKind::Network => Criteria::Network(network_criteria(entry).map_err(fail)?),
            OperationKind::File => Criteria::File(file_criteria(entry).map_err(fail)?),
            OperationKind::Control => return Err(fail(ParseErrorKind::EmptyCriteria)),
        };

        rules.push(Rule {
            name: entry.name.clone(),
            criteria,
            action,
            message: entry.message.clone().unwrap_or_default(),
            timeout,
            on_timeout,
            line,
        });
    }

    Ok(rules)
}

/// First field set on a rule that belongs to another kind
fn foreign_field(kind: OperationKind, r: &RawRule) -> Option<&'static str> {
    let command = [("commands", !r.commands.is_empty()), ("args_patterns", !r.args_patterns.is_empty())];
    let network = [
        ("domains", !r.domains.is_empty()),
        ("cidrs", !r.cidrs.is_empty()),
        ("ports", !r.ports.is_empty()),
    ];
    let file = [("paths", !r.paths.is_empty()), ("operations", !r.operations.is_empty())];

    let foreign: Vec<(&'static str, bool)> = match kind {
        OperationKind::Command => network.iter().chain(file.iter()).copied().collect(),
        OperationKind::Network => command.iter().chain(file.iter()).copied().collect(),
        OperationKind::File => command.iter().chain(network.iter()).copied().collect(),
        OperationKind::Control => Vec::new(),
    };
    foreign.into_iter().find(|(_, set)| *set).map(|(name, _)| name)
}

fn command_criteria(r: &RawRule) -> Result<CommandCriteria, ParseErrorKind> {
    if r.commands.is_empty() {
        return Err(ParseErrorKind::EmptyCriteria);
    }
    let args_patterns = r
        .args_patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| ParseErrorKind::InvalidRegex(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CommandCriteria {
        commands: r.commands.iter().map(|c| c.trim().to_string()).collect(),
        args_patterns,
    })
}

fn network_criteria(r: &RawRule) -> Result<NetworkCriteria, ParseErrorKind> {
    if r.domains.is_empty() && r.cidrs.is_empty() && r.ports.is_empty() {
        return Err(ParseErrorKind::EmptyCriteria);
    }
    let domains = r
        .domains
        .iter()
        .map(|d| DomainPattern::parse(d).ok_or_else(|| ParseErrorKind::InvalidDomain(d.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    let cidrs = r
        .cidrs
        .iter()
        .map(|c| parse_cidr(c).ok_or_else(|| ParseErrorKind::InvalidCidr(c.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NetworkCriteria {
        domains,
        cidrs,
        ports: r.ports.clone(),
    })
}

fn file_criteria(r: &RawRule) -> Result<FileCriteria, ParseErrorKind> {
    if r.paths.is_empty() {
        return Err(ParseErrorKind::EmptyCriteria);
    }
    let paths = r
        .paths
        .iter()
        .map(|p| PathGlob::new(p).map_err(|e| ParseErrorKind::InvalidGlob(format!("{}: {}", p, e))))
        .collect::<Result<Vec<_>, _>>()?;

    let mut operations = Vec::new();
    if r.operations.is_empty() {
        operations.extend_from_slice(FileOp::all());
    }
    for op in &r.operations {
        if op.trim() == "*" {
            operations = FileOp::all().to_vec();
            break;
        }
        let parsed = FileOp::from_str(op.trim()).ok_or_else(|| ParseErrorKind::UnknownOperation(op.clone()))?;
        if !operations.contains(&parsed) {
            operations.push(parsed);
        }
    }

    Ok(FileCriteria { paths, operations })
}

/// CIDR block or a bare address (treated as a single-host block)
fn parse_cidr(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(net.trunc());
    }
    raw.parse::<IpAddr>().ok().map(IpNet::from)
}

fn parse_duration(raw: &str) -> Option<Duration> {
    humantime::parse_duration(raw.trim()).ok()
}

/// 1-based line of a top-level key
fn find_top_level_key(raw: &str, key: &str) -> Option<usize> {
    let prefix = format!("{}:", key);
    raw.lines()
        .position(|line| line.starts_with(&prefix))
        .map(|i| i + 1)
}

/// Lines of each rule's `name:` entry within a section, in order
fn rule_lines(raw: &str, section: &str) -> Vec<usize> {
    let Some(start) = find_top_level_key(raw, section) else {
        return Vec::new();
    };

    let mut lines = Vec::new();
    for (i, line) in raw.lines().enumerate().skip(start) {
        if is_top_level_key(line) {
            break;
        }
        if name_value(line).is_some() {
            lines.push(i + 1);
        }
    }
    lines
}

/// Name of the rule containing a 1-based line, scanning upwards
fn enclosing_rule(raw: &str, line: usize) -> Option<String> {
    let lines: Vec<&str> = raw.lines().collect();
    let upto = line.min(lines.len());
    for text in lines[..upto].iter().rev() {
        if let Some(name) = name_value(text) {
            return Some(name);
        }
        if is_top_level_key(text) {
            return None;
        }
    }
    None
}

fn is_top_level_key(line: &str) -> bool {
    line.chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
}

fn name_value(line: &str) -> Option<String> {
    let t = line.trim_start();
    let t = t.strip_prefix("- ").unwrap_or(t).trim_start();
    let value = t.strip_prefix("name:")?.trim();
    let value = value
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string();
    Some(value)
}
