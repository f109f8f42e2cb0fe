//! Non-overridable filesystem floor
//!
//! Checked before any file rule. Kernel interfaces and container runtime
//! sockets are refused for every operation; system binaries and the
//! gateway's own state are refused for write and delete.

use policy::{Action, Decision, FileOp, Reason};
use std::path::{Path, PathBuf};

/// Refused for any operation
pub const DENY_ALL: &[&str] = &[
    "/proc",
    "/sys",
    "/dev/mem",
    "/dev/kmem",
    "/dev/port",
    "/var/run/docker.sock",
    "/run/docker.sock",
    "/run/containerd",
    "/var/run/crio",
    "/run/podman",
];

/// Refused for write and delete
pub const DENY_MODIFY: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/usr/lib/warden",
];

#[derive(Debug, Clone)]
pub struct Floor {
    deny_all: Vec<PathBuf>,
    deny_modify: Vec<PathBuf>,
}

impl Floor {
    pub fn builtin() -> Self {
        Self {
            deny_all: DENY_ALL.iter().map(PathBuf::from).collect(),
            deny_modify: DENY_MODIFY.iter().map(PathBuf::from).collect(),
        }
    }

    /// Add a path (and everything below it) to the write/delete floor
    pub fn protect(mut self, path: &Path) -> Self {
        self.deny_modify.push(path.to_path_buf());
        self
    }

    /// Deny decision when the path sits on the floor. Writes and deletes are
    /// also refused on any directory that contains a floor path.
    pub fn check(&self, path: &Path, op: FileOp, ruleset_version: u64) -> Option<Decision> {
        let hit = self.deny_all.iter().find(|p| path.starts_with(p)).or_else(|| {
            if op == FileOp::Read {
                return None;
            }
            self.deny_all
                .iter()
                .chain(self.deny_modify.iter())
                .find(|p| path.starts_with(p) || p.starts_with(path))
        })?;

        let mut decision = Decision::new(
            Action::Deny,
            Reason::Floor,
            format!("{} {} is not permitted under {}", op, path.display(), hit.display()),
        );
        decision.ruleset_version = ruleset_version;
        Some(decision)
    }
}
