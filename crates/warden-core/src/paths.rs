//! Standard paths used by warden

use std::path::{Path, PathBuf};

/// Standard warden paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (/var/lib/warden or ~/.local/share/warden)
    pub data: PathBuf,
    /// Config directory (/etc/warden or ~/.config/warden)
    pub config: PathBuf,
    /// Runtime directory (/run/warden or the data directory)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        // System-wide install (sandbox images) wins over per-user dirs
        let data = if Path::new("/var/lib/warden").is_dir() {
            PathBuf::from("/var/lib/warden")
        } else {
            dirs::data_dir()
                .unwrap_or_else(|| expand("~/.local/share"))
                .join("warden")
        };

        let config = if Path::new("/etc/warden").is_dir() {
            PathBuf::from("/etc/warden")
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| expand("~/.config"))
                .join("warden")
        };

        let runtime = if Path::new("/run/warden").is_dir() {
            PathBuf::from("/run/warden")
        } else {
            data.clone()
        };

        Self {
            data,
            config,
            runtime,
        }
    }

    /// Paths rooted at an arbitrary directory (tests, throwaway sandboxes)
    pub fn rooted(root: &Path) -> Self {
        Self {
            data: root.join("data"),
            config: root.join("config"),
            runtime: root.join("run"),
        }
    }

    /// Server configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yaml")
    }

    /// Active policy document
    pub fn policy_file(&self) -> PathBuf {
        self.config.join("policy.yaml")
    }

    /// Control socket used by interceptors
    pub fn socket(&self) -> PathBuf {
        self.runtime.join("warden.sock")
    }

    /// Owner-only socket for operator tooling
    pub fn operator_socket(&self) -> PathBuf {
        self.runtime.join("warden-operator.sock")
    }

    /// Audit database
    pub fn audit_db(&self) -> PathBuf {
        self.data.join("audit.db")
    }

    /// JSON-lines spill file used while the audit store is degraded
    pub fn audit_spill(&self) -> PathBuf {
        self.data.join("audit-spill.jsonl")
    }

    /// Quarantine root for soft-deleted files
    pub fn quarantine(&self) -> PathBuf {
        self.data.join("quarantine")
    }
}

/// Expand `~` and environment variables in a configured path
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
