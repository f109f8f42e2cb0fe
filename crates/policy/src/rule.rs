//! Rules and their match criteria
//!
//! One [`Rule`] type for every kind; the kind-specific part is the
//! [`Criteria`] variant, dispatched through [`Criteria::matches`].

use crate::decision::{Action, Decision, Reason, TimeoutFallback};
use crate::error::MatchError;
use crate::operation::{FileOp, OperationKind, Target};
use glob::{MatchOptions, Pattern};
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A named policy rule
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique within its kind list
    pub name: String,
    pub criteria: Criteria,
    pub action: Action,
    pub message: String,
    /// Approval timeout (approve rules only)
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutFallback,
    /// Line in the policy document where the rule starts
    pub line: Option<usize>,
}

impl Rule {
    pub fn kind(&self) -> OperationKind {
        self.criteria.kind()
    }

    /// Decision rendered when this rule matches
    pub fn decision(&self, ruleset_version: u64) -> Decision {
        Decision {
            action: self.action,
            reason: Reason::Rule,
            matched_rule: Some(self.name.clone()),
            message: self.message.clone(),
            timeout: self.timeout,
            on_timeout: self.on_timeout,
            ruleset_version,
        }
    }
}

/// Kind-specific match criteria
#[derive(Debug, Clone)]
pub enum Criteria {
    Command(CommandCriteria),
    Network(NetworkCriteria),
    File(FileCriteria),
}

impl Criteria {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Command(_) => OperationKind::Command,
            Self::Network(_) => OperationKind::Network,
            Self::File(_) => OperationKind::File,
        }
    }

    /// Test the criteria against a target of the same kind
    pub fn matches(&self, rule: &str, target: &Target) -> Result<bool, MatchError> {
        match (self, target) {
            (Self::Command(c), Target::Command { program, args, .. }) => Ok(c.matches(program, args)),
            (Self::Network(c), Target::Network { host, port, addrs, .. }) => {
                Ok(c.matches(host, *port, addrs))
            }
            (Self::File(c), Target::File { path, operation }) => Ok(c.matches(path, *operation)),
            _ => Err(MatchError::CriteriaMismatch {
                rule: rule.to_string(),
                kind: target.kind(),
            }),
        }
    }

    /// Short human description for listings
    pub fn describe(&self) -> String {
        match self {
            Self::Command(c) => {
                let mut out = c.commands.join(",");
                if !c.args_patterns.is_empty() {
                    let pats: Vec<&str> = c.args_patterns.iter().map(|r| r.as_str()).collect();
                    out.push_str(&format!(" args~{}", pats.join("|")));
                }
                out
            }
            Self::Network(c) => {
                let mut parts = Vec::new();
                if !c.domains.is_empty() {
                    let d: Vec<String> = c.domains.iter().map(|d| d.to_string()).collect();
                    parts.push(d.join(","));
                }
                if !c.cidrs.is_empty() {
                    let n: Vec<String> = c.cidrs.iter().map(|n| n.to_string()).collect();
                    parts.push(n.join(","));
                }
                if !c.ports.is_empty() {
                    let p: Vec<String> = c.ports.iter().map(|p| p.to_string()).collect();
                    parts.push(format!("ports {}", p.join(",")));
                }
                parts.join(" ")
            }
            Self::File(c) => {
                let paths: Vec<&str> = c.paths.iter().map(|p| p.source.as_str()).collect();
                let ops: Vec<&str> = c.operations.iter().map(|o| o.as_str()).collect();
                format!("{} [{}]", paths.join(","), ops.join(","))
            }
        }
    }
}

/// Program name set plus optional argument patterns
#[derive(Debug, Clone)]
pub struct CommandCriteria {
    /// Program basenames; `*` matches any program
    pub commands: Vec<String>,
    /// Regexes searched in the argument vector; empty matches any arguments
    pub args_patterns: Vec<Regex>,
}

impl CommandCriteria {
    pub fn matches(&self, program: &str, args: &[String]) -> bool {
        let base = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);

        let named = self.commands.iter().any(|c| c == "*" || c == base);
        if !named {
            return false;
        }
        if self.args_patterns.is_empty() {
            return true;
        }

        let joined = args.join(" ");
        self.args_patterns
            .iter()
            .any(|re| args.iter().any(|a| re.is_match(a)) || re.is_match(&joined))
    }
}

/// Domain pattern: exact, leading wildcard, or everything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Any,
    Exact(String),
    /// `*.example.com`; also matches `example.com` itself
    Suffix(String),
}

impl DomainPattern {
    /// Parse a pattern, returning None when it is not a usable domain
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_end_matches('.').to_lowercase();
        if raw == "*" {
            return Some(Self::Any);
        }
        let (suffix, body) = match raw.strip_prefix("*.") {
            Some(rest) => (true, rest.to_string()),
            None => (false, raw),
        };
        let valid = !body.is_empty()
            && body
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'));
        if !valid {
            return None;
        }
        Some(if suffix {
            Self::Suffix(body)
        } else {
            Self::Exact(body)
        })
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(d) => host == *d,
            Self::Suffix(d) => host == *d || host.ends_with(&format!(".{}", d)),
        }
    }
}

impl std::fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(d) => write!(f, "{}", d),
            Self::Suffix(d) => write!(f, "*.{}", d),
        }
    }
}

/// Destination criteria
#[derive(Debug, Clone, Default)]
pub struct NetworkCriteria {
    pub domains: Vec<DomainPattern>,
    pub cidrs: Vec<IpNet>,
    pub ports: Vec<u16>,
}

impl NetworkCriteria {
    /// (domain OR cidr, when either is listed) AND (port, when listed)
    pub fn matches(&self, host: &str, port: u16, addrs: &[IpAddr]) -> bool {
        let port_ok = self.ports.is_empty() || self.ports.contains(&port);
        if !port_ok {
            return false;
        }
        if self.domains.is_empty() && self.cidrs.is_empty() {
            return true;
        }

        if self.domains.iter().any(|d| d.matches(host)) {
            return true;
        }

        let literal = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().ok();
        self.cidrs.iter().any(|net| {
            addrs
                .iter()
                .chain(literal.iter())
                .any(|ip| net.contains(ip) || net.contains(&canonical(*ip)))
        })
    }
}

/// IPv4-mapped IPv6 addresses compare as the IPv4 address they carry
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    }
}

/// A path glob with its original text
#[derive(Debug, Clone)]
pub struct PathGlob {
    /// As written in the policy
    pub source: String,
    pattern: Pattern,
}

impl PathGlob {
    /// Compile a glob, expanding a leading `~`
    pub fn new(source: &str) -> Result<Self, glob::PatternError> {
        let expanded = shellexpand::tilde(source).to_string();
        Ok(Self {
            source: source.to_string(),
            pattern: Pattern::new(&expanded)?,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.pattern.matches_path_with(path, glob_options())
    }

    pub fn expanded(&self) -> PathBuf {
        PathBuf::from(self.pattern.as_str())
    }
}

/// `*` stays within one component, `**` crosses directories
pub fn glob_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Path and operation criteria
#[derive(Debug, Clone)]
pub struct FileCriteria {
    pub paths: Vec<PathGlob>,
    /// Operations the rule covers; all three when the policy says `*`
    pub operations: Vec<FileOp>,
}

impl FileCriteria {
    pub fn matches(&self, path: &Path, op: FileOp) -> bool {
        self.operations.contains(&op) && self.paths.iter().any(|g| g.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rm_recursive() -> CommandCriteria {
        CommandCriteria {
            commands: vec!["rm".to_string()],
            args_patterns: vec![
                Regex::new("^-[a-zA-Z]*[rR][a-zA-Z]*$").unwrap(),
                Regex::new("^--recursive$").unwrap(),
            ],
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_args_patterns() {
        let c = rm_recursive();
        assert!(!c.matches("rm", &args(&["file.txt"])));
        assert!(c.matches("rm", &args(&["-rf", "/home"])));
        assert!(c.matches("/usr/bin/rm", &args(&["-f", "-R", "dir"])));
        assert!(c.matches("rm", &args(&["--recursive", "dir"])));
        assert!(!c.matches("rmdir", &args(&["-r"])));
    }

    #[test]
    fn test_command_wildcard_and_no_patterns() {
        let c = CommandCriteria {
            commands: vec!["*".to_string()],
            args_patterns: vec![],
        };
        assert!(c.matches("anything", &[]));
    }

    #[test]
    fn test_domain_patterns() {
        let exact = DomainPattern::parse("Example.COM.").unwrap();
        assert!(exact.matches("example.com"));
        assert!(!exact.matches("api.example.com"));

        let suffix = DomainPattern::parse("*.example.com").unwrap();
        assert!(suffix.matches("api.example.com"));
        assert!(suffix.matches("a.b.example.com"));
        assert!(suffix.matches("example.com"));
        assert!(!suffix.matches("badexample.com"));

        assert_eq!(DomainPattern::parse("*"), Some(DomainPattern::Any));
        assert_eq!(DomainPattern::parse("exa mple.com"), None);
        assert_eq!(DomainPattern::parse("foo.*.com"), None);
    }

    #[test]
    fn test_network_combination() {
        let c = NetworkCriteria {
            domains: vec![DomainPattern::parse("metadata.google.internal").unwrap()],
            cidrs: vec!["169.254.0.0/16".parse().unwrap()],
            ports: vec![80, 443],
        };
        assert!(c.matches("169.254.169.254", 80, &[]));
        assert!(c.matches("metadata.google.internal", 443, &[]));
        assert!(!c.matches("169.254.169.254", 8080, &[]));

        let resolved: IpAddr = "169.254.1.1".parse().unwrap();
        assert!(c.matches("innocent.example", 80, &[resolved]));
        assert!(!c.matches("innocent.example", 80, &["93.184.216.34".parse().unwrap()]));
    }

    #[test]
    fn test_mapped_resolved_address_matches() {
        let c = NetworkCriteria {
            cidrs: vec!["169.254.0.0/16".parse().unwrap()],
            ..Default::default()
        };
        let mapped: IpAddr = "::ffff:169.254.169.254".parse().unwrap();
        assert!(c.matches("innocent.example", 80, &[mapped]));
        assert_eq!(canonical(mapped), "169.254.169.254".parse::<IpAddr>().unwrap());
        assert_eq!(canonical("::1".parse().unwrap()), "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_ports_only_rule() {
        let c = NetworkCriteria {
            ports: vec![25],
            ..Default::default()
        };
        assert!(c.matches("smtp.example.com", 25, &[]));
        assert!(!c.matches("smtp.example.com", 587, &[]));
    }

    #[test]
    fn test_file_globs() {
        let c = FileCriteria {
            paths: vec![PathGlob::new("/etc/sudoers.d/**").unwrap(), PathGlob::new("/tmp/*.key").unwrap()],
            operations: vec![FileOp::Read, FileOp::Write],
        };
        assert!(c.matches(Path::new("/etc/sudoers.d/90-agent"), FileOp::Read));
        assert!(c.matches(Path::new("/tmp/a.key"), FileOp::Write));
        assert!(!c.matches(Path::new("/tmp/nested/a.key"), FileOp::Write));
        assert!(!c.matches(Path::new("/tmp/a.key"), FileOp::Delete));
    }

    #[test]
    fn test_tilde_glob_expands() {
        let glob = PathGlob::new("~/.ssh/**").unwrap();
        let home_key = PathBuf::from(shellexpand::tilde("~/.ssh/id_rsa").to_string());
        assert!(glob.matches(&home_key));
        assert_eq!(glob.source, "~/.ssh/**");
    }

    #[test]
    fn test_criteria_kind_mismatch_is_error() {
        let criteria = Criteria::Command(rm_recursive());
        let target = Target::file("/tmp/x", FileOp::Read);
        assert!(criteria.matches("r", &target).is_err());
    }
}
