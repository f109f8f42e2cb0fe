//! Operation descriptors
//!
//! The normalised subject of every evaluation. Interceptors build one per
//! intercepted operation; the matcher reads it, the audit log keeps it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Kind of operation, selecting the rule list used for evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Command,
    Network,
    File,
    /// Gateway housekeeping (policy reloads); audited, never matched
    Control,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Network => "network",
            Self::File => "file",
            Self::Control => "control",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "command" => Some(Self::Command),
            "network" => Some(Self::Network),
            "file" => Some(Self::File),
            "control" => Some(Self::Control),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File operations a rule can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Read,
    Write,
    Delete,
}

impl FileOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Read, Self::Write, Self::Delete]
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport of an outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain HTTP forwarded by the proxy
    Http,
    /// HTTPS tunnelled after a CONNECT
    Https,
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// What the operation acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    Network {
        host: String,
        port: u16,
        transport: Transport,
        /// Addresses the host resolved to; these are the addresses dialled
        #[serde(default)]
        addrs: Vec<IpAddr>,
    },
    File {
        path: PathBuf,
        operation: FileOp,
    },
    Control {
        action: String,
        #[serde(default)]
        detail: String,
    },
}

impl Target {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Command { .. } => OperationKind::Command,
            Self::Network { .. } => OperationKind::Network,
            Self::File { .. } => OperationKind::File,
            Self::Control { .. } => OperationKind::Control,
        }
    }

    /// Build a command target
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self::Command {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    /// Build a network target; literal IP hosts carry themselves as address
    pub fn network(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        let host = normalize_host(&host.into());
        let addrs = host.parse::<IpAddr>().map(|ip| vec![ip]).unwrap_or_default();
        Self::Network {
            host,
            port,
            transport,
            addrs,
        }
    }

    /// Build a file target
    pub fn file(path: impl AsRef<Path>, operation: FileOp) -> Self {
        Self::File {
            path: path.as_ref().to_path_buf(),
            operation,
        }
    }

    /// One-line human summary, used in logs and audit listings
    pub fn summary(&self) -> String {
        match self {
            Self::Command { program, args, .. } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
            Self::Network {
                host,
                port,
                transport,
                ..
            } => format!("{}://{}:{}", transport.as_str(), host, port),
            Self::File { path, operation } => format!("{} {}", operation, path.display()),
            Self::Control { action, detail } => {
                if detail.is_empty() {
                    action.clone()
                } else {
                    format!("{} {}", action, detail)
                }
            }
        }
    }
}

/// Lowercase a host, strip a trailing dot and IPv6 brackets
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_lowercase()
}

/// Normalised subject of a policy evaluation. Created at interception time
/// and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Unique operation id
    pub id: Uuid,

    /// Agent session the operation belongs to
    pub session_id: String,

    /// Who issued it (user, agent name, uid)
    pub actor: String,

    pub target: Target,

    /// Interception time
    pub timestamp: DateTime<Utc>,
}

impl OperationDescriptor {
    pub fn new(session_id: impl Into<String>, actor: impl Into<String>, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            actor: actor.into(),
            target,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.target.kind()
    }

    /// Same descriptor with resolved addresses attached (network only)
    pub fn with_addrs(mut self, resolved: Vec<IpAddr>) -> Self {
        if let Target::Network { addrs, .. } = &mut self.target {
            for ip in resolved {
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }
        self
    }
}
