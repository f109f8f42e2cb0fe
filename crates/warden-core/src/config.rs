//! Server configuration
//!
//! Configuration file: /etc/warden/config.yaml or ~/.config/warden/config.yaml,
//! overridden by `WARDEN_CONFIG`. Every section is optional; a missing file
//! yields the defaults.

use crate::format::duration_str;
use crate::paths::{expand, Paths};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable selecting the configuration file
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// Environment variable selecting the control socket used by interceptors
pub const SOCKET_ENV: &str = "WARDEN_SOCKET";

/// Top-level server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub approvals: ApprovalConfig,

    #[serde(default)]
    pub quarantine: QuarantineConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub dlp: DlpConfig,

    #[serde(default)]
    pub shim: ShimConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,
}

impl ServerConfig {
    /// Load configuration from `WARDEN_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(p) => PathBuf::from(p),
            None => Paths::new().config_file(),
        };
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read server config from {:?}", path))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse server config from {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Control socket, honouring `WARDEN_SOCKET`
    pub fn socket_path(&self, paths: &Paths) -> PathBuf {
        if let Some(p) = std::env::var_os(SOCKET_ENV) {
            return PathBuf::from(p);
        }
        self.control
            .socket
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| paths.socket())
    }

    /// Operator socket; `None` when disabled
    pub fn operator_socket_path(&self, paths: &Paths) -> Option<PathBuf> {
        match self.control.operator_socket.as_deref() {
            Some("") => None,
            Some(p) => Some(expand(p)),
            None => Some(paths.operator_socket()),
        }
    }

    pub fn policy_path(&self, paths: &Paths) -> PathBuf {
        self.policy
            .path
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| paths.policy_file())
    }

    pub fn audit_path(&self, paths: &Paths) -> PathBuf {
        self.audit
            .path
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| paths.audit_db())
    }

    pub fn spill_path(&self, paths: &Paths) -> PathBuf {
        self.audit
            .spill_path
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| paths.audit_spill())
    }

    pub fn quarantine_root(&self, paths: &Paths) -> PathBuf {
        self.quarantine
            .root
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| paths.quarantine())
    }
}

/// Control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// HTTP listen address for health/ready/metrics/reload/rpc
    #[serde(default = "default_control_listen")]
    pub listen: String,

    /// Unix socket for the line-delimited JSON-RPC endpoint the shims use
    #[serde(default)]
    pub socket: Option<String>,

    /// Owner-only Unix socket for operator methods (approvals, reloads,
    /// quarantine, sessions, audit). An empty string disables it.
    #[serde(default)]
    pub operator_socket: Option<String>,
}

fn default_control_listen() -> String {
    "127.0.0.1:7766".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
            socket: None,
            operator_socket: None,
        }
    }
}

/// Policy document location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Path to the policy YAML; the bundled default policy is used when absent
    #[serde(default)]
    pub path: Option<String>,
}

/// Network proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_listen")]
    pub listen: String,

    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    #[serde(default = "default_resolve_timeout", with = "duration_str")]
    pub resolve_timeout: Duration,

    /// Largest textual response body passed through the redactor
    #[serde(default = "default_max_redact_bytes")]
    pub max_redact_bytes: usize,

    /// Largest request head accepted from a client
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_proxy_listen() -> String {
    "127.0.0.1:8118".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_redact_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_header_bytes() -> usize {
    16 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            connect_timeout: default_connect_timeout(),
            resolve_timeout: default_resolve_timeout(),
            max_redact_bytes: default_max_redact_bytes(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

/// Audit log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub spill_path: Option<String>,

    /// Retention in days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_sweep_interval", with = "duration_str")]
    pub sweep_interval: Duration,
}

fn default_retention_days() -> u32 {
    90
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            spill_path: None,
            retention_days: default_retention_days(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Approval broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Timeout used when neither the rule nor the policy defaults name one
    #[serde(default = "default_approval_timeout", with = "duration_str")]
    pub default_timeout: Duration,
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_approval_timeout(),
        }
    }
}

/// Quarantine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineConfig {
    #[serde(default)]
    pub root: Option<String>,

    /// Entries older than this are purged; 0 keeps them forever
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u32,
}

fn default_purge_after_days() -> u32 {
    7
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            root: None,
            purge_after_days: default_purge_after_days(),
        }
    }
}

/// Resource-limit defaults. Enforced by the hosting environment; warden only
/// reports them and counts limit trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub cpu_percent: Option<u32>,

    #[serde(default)]
    pub max_processes: Option<u32>,

    #[serde(default)]
    pub disk_io_mbps: Option<u32>,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    #[serde(default = "default_limit_poll", with = "duration_str")]
    pub poll_interval: Duration,
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_limit_poll() -> Duration {
    Duration::from_secs(30)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_mb: None,
            cpu_percent: None,
            max_processes: None,
            disk_io_mbps: None,
            cgroup_root: default_cgroup_root(),
            poll_interval: default_limit_poll(),
        }
    }
}

/// A custom redaction pattern from the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub replacement: Option<String>,
}

/// DLP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Include the built-in credential / PII patterns
    #[serde(default = "default_true")]
    pub builtin: bool,

    #[serde(default)]
    pub patterns: Vec<PatternConfig>,

    /// Pipe shimmed command output through the redactor
    #[serde(default = "default_true")]
    pub redact_command_output: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DlpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            builtin: true,
            patterns: Vec::new(),
            redact_command_output: true,
        }
    }
}

/// Shim settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimConfig {
    /// The real shell the shim hands approved lines to
    #[serde(default = "default_real_shell")]
    pub real_shell: PathBuf,

    /// Directory holding the multi-call symlinks; removed from PATH on exec
    #[serde(default = "default_shim_dir")]
    pub shim_dir: PathBuf,

    /// Export HTTP(S)_PROXY to wrapped commands
    #[serde(default = "default_true")]
    pub export_proxy: bool,
}

fn default_real_shell() -> PathBuf {
    PathBuf::from("/bin/bash.real")
}

fn default_shim_dir() -> PathBuf {
    PathBuf::from("/usr/lib/warden/shims")
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            real_shell: default_real_shell(),
            shim_dir: default_shim_dir(),
            export_proxy: true,
        }
    }
}

/// Network enforcement backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackend {
    Proxy,
    Off,
}

/// Process / file enforcement backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessBackend {
    Shim,
    Off,
}

/// Which enforcement backends the daemon starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default = "default_network_backend")]
    pub network: NetworkBackend,

    #[serde(default = "default_process_backend")]
    pub process: ProcessBackend,
}

fn default_network_backend() -> NetworkBackend {
    NetworkBackend::Proxy
}

fn default_process_backend() -> ProcessBackend {
    ProcessBackend::Shim
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            network: default_network_backend(),
            process: default_process_backend(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::load_from(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.audit.retention_days, 90);
        assert_eq!(config.approvals.default_timeout, Duration::from_secs(300));
        assert_eq!(config.enforcement.network, NetworkBackend::Proxy);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "proxy:\n  listen: 0.0.0.0:3128\n  connect_timeout: 2s\napprovals:\n  default_timeout: 90s\ndlp:\n  patterns:\n    - name: ticket\n      pattern: 'TICKET-[0-9]+'\n",
        )
        .unwrap();

        let config = ServerConfig::load_from(&path).unwrap();
        assert_eq!(config.proxy.listen, "0.0.0.0:3128");
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.approvals.default_timeout, Duration::from_secs(90));
        assert_eq!(config.dlp.patterns.len(), 1);
        assert!(config.dlp.builtin);
        assert_eq!(config.control.listen, "127.0.0.1:7766");
    }

    #[test]
    fn test_save_round_trip_keeps_durations_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        ServerConfig::default().save_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("default_timeout: 5m"));
    }
}
