//! Filesystem guard
//!
//! Read, write and delete on behalf of an agent. Paths are normalised and
//! symlinks in the parent chain resolved before evaluation, so the decision
//! is made on the file that is actually touched. Deletes never unlink: the
//! target is moved to quarantine, and a failed move denies the delete.

mod floor;
mod quarantine;

pub use floor::{Floor, DENY_ALL, DENY_MODIFY};
pub use quarantine::{Quarantine, QuarantineEntry, QuarantineError};

use crate::engine::{Caller, Engine, Verdict};
use policy::{FileOp, Target};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("{}", .0.signal())]
    Denied(Box<Verdict>),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Self::Denied(v) => Some(v),
            Self::Io { .. } => None,
        }
    }
}

/// Lexical normalisation: absolute against `cwd`, `.` and `..` removed
pub fn normalize(path: &Path, cwd: Option<&Path>) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.unwrap_or_else(|| Path::new("/")).join(path)
    };

    let mut out = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// The path an operation really touches. Reads and writes follow symlinks;
/// a delete removes the link itself, so only its parent is resolved.
pub fn resolve_target(path: &Path, op: FileOp) -> PathBuf {
    if op != FileOp::Delete {
        if let Ok(real) = std::fs::canonicalize(path) {
            return real;
        }
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match std::fs::canonicalize(parent) {
            Ok(real_parent) => real_parent.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

impl Engine {
    fn file_target(&self, caller: &Caller, path: &Path, op: FileOp) -> PathBuf {
        resolve_target(&normalize(path, caller.cwd.as_deref()), op)
    }

    /// Read a file. Content is only returned after the read is audited.
    pub async fn read_file(&self, caller: &Caller, path: &Path) -> Result<Vec<u8>, FsError> {
        let target = self.file_target(caller, path, FileOp::Read);
        let mut pending = self.check(caller.descriptor(Target::file(&target, FileOp::Read))).await;
        if !pending.allowed() {
            return Err(FsError::Denied(Box::new(self.finish(pending).await)));
        }

        let data = tokio::fs::read(&target).await;
        if let Err(ref e) = data {
            pending.note(format!("read failed: {}", e));
        }
        let verdict = self.finish(pending).await;
        if !verdict.allowed() {
            return Err(FsError::Denied(Box::new(verdict)));
        }
        data.map_err(|source| FsError::Io { path: target, source })
    }

    /// Write a file, after the write is audited
    pub async fn write_file(&self, caller: &Caller, path: &Path, data: &[u8]) -> Result<u64, FsError> {
        let target = self.file_target(caller, path, FileOp::Write);
        let verdict = self.authorize(caller.descriptor(Target::file(&target, FileOp::Write))).await;
        if !verdict.allowed() {
            return Err(FsError::Denied(Box::new(verdict)));
        }

        tokio::fs::write(&target, data)
            .await
            .map_err(|source| FsError::Io { path: target, source })?;
        Ok(data.len() as u64)
    }

    /// Soft-delete: move the target to quarantine
    pub async fn delete_file(&self, caller: &Caller, path: &Path) -> Result<QuarantineEntry, FsError> {
        let target = self.file_target(caller, path, FileOp::Delete);
        let mut pending = self.check(caller.descriptor(Target::file(&target, FileOp::Delete))).await;
        if !pending.allowed() {
            return Err(FsError::Denied(Box::new(self.finish(pending).await)));
        }

        let moved = self
            .quarantine()
            .move_in(&target, &caller.session, Some(pending.operation.id));
        match moved {
            Ok(ref entry) => pending.note(format!("quarantined as {}", entry.quarantine_path.display())),
            Err(ref e) => {
                warn!(path = %target.display(), error = %e, "quarantine move failed, denying delete");
                pending.refuse(format!("delete refused: {}", e));
            }
        }

        let verdict = self.finish(pending).await;
        match moved {
            Ok(entry) if verdict.allowed() => {
                self.metrics().quarantine_move();
                Ok(entry)
            }
            Ok(entry) => {
                // Audit refused the delete after the move; put the file back
                if let Err(e) = self.quarantine().restore(entry.id, false) {
                    warn!(id = %entry.id, error = %e, "failed to undo quarantine move");
                }
                Err(FsError::Denied(Box::new(verdict)))
            }
            Err(_) => Err(FsError::Denied(Box::new(verdict))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::engine_with_policy;
    use audit::{AuditQuery, Outcome};
    use policy::Reason;
    use std::fs;
    use warden_core::Paths;

    const POLICY: &str = r#"
version: 1
defaults:
  file: allow
file_rules:
  - name: no-secrets
    paths: ["**/secrets/**"]
    decision: deny
    message: secrets are off limits
"#;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c"), None), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("x/y"), Some(Path::new("/work"))), PathBuf::from("/work/x/y"));
        assert_eq!(normalize(Path::new("../../.."), Some(Path::new("/a"))), PathBuf::from("/"));
    }

    #[tokio::test]
    async fn test_delete_goes_to_quarantine() {
        let (engine, dir) = engine_with_policy(POLICY);
        let file = dir.path().join("work").join("draft.txt");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "contents").unwrap();

        let caller = Caller::new("s1", "agent");
        let entry = engine.delete_file(&caller, &file).await.unwrap();
        assert!(!file.exists());
        assert_eq!(fs::read_to_string(&entry.quarantine_path).unwrap(), "contents");
        assert_eq!(engine.metrics().quarantine_moves(), 1);

        let events = engine.query_audit(AuditQuery::default().session("s1")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].note.as_deref().unwrap().contains("quarantined as"));
    }

    #[tokio::test]
    async fn test_failed_move_denies_delete() {
        let (engine, dir) = engine_with_policy(POLICY);
        let caller = Caller::new("s1", "agent");
        let err = engine.delete_file(&caller, &dir.path().join("missing")).await.unwrap_err();

        let verdict = err.verdict().unwrap();
        assert_eq!(verdict.outcome, Outcome::Denied);
        assert!(verdict.signal().contains("delete refused"));
    }

    #[tokio::test]
    async fn test_rule_denies_read() {
        let (engine, dir) = engine_with_policy(POLICY);
        let secret = dir.path().join("secrets").join("token");
        fs::create_dir_all(secret.parent().unwrap()).unwrap();
        fs::write(&secret, "hunter2").unwrap();

        let err = engine.read_file(&Caller::new("s1", "agent"), &secret).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "warden: blocked by policy rule 'no-secrets': secrets are off limits"
        );
    }

    #[tokio::test]
    async fn test_symlink_into_floor_is_denied() {
        let (engine, dir) = engine_with_policy(POLICY);
        let link = dir.path().join("innocent");
        std::os::unix::fs::symlink("/proc/self/environ", &link).unwrap();

        let err = engine.read_file(&Caller::new("s1", "agent"), &link).await.unwrap_err();
        assert_eq!(err.verdict().unwrap().decision.reason, Reason::Floor);
    }

    #[tokio::test]
    async fn test_deleting_policy_directory_is_denied() {
        let (engine, dir) = engine_with_policy(POLICY);
        let policy_file = Paths::rooted(dir.path()).policy_file();
        let config_dir = policy_file.parent().unwrap().to_path_buf();

        let err = engine
            .delete_file(&Caller::new("s1", "agent"), &config_dir)
            .await
            .unwrap_err();
        assert_eq!(err.verdict().unwrap().decision.reason, Reason::Floor);
        assert!(policy_file.exists());
        assert!(engine.quarantine().list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_and_read_allowed() {
        let (engine, dir) = engine_with_policy(POLICY);
        let caller = Caller::new("s1", "agent").with_cwd(dir.path());
        engine.write_file(&caller, Path::new("out.txt"), b"hello").await.unwrap();
        let data = engine.read_file(&caller, Path::new("./out.txt")).await.unwrap();
        assert_eq!(data, b"hello");
    }
}
