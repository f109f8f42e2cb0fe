//! Rule store with atomic hot reload
//!
//! Readers take a wait-free snapshot (`current()`); a reload builds the next
//! RuleSet off to the side and publishes it with a single pointer swap, so an
//! evaluation sees either the old set or the new one, never a mix.

use crate::document::{digest, load_with_source};
use crate::error::PolicyParseError;
use crate::ruleset::RuleSet;
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Result of a successful reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new version is active
    Updated { from: u64, to: u64 },
    /// The document was identical to the active one
    Unchanged { version: u64 },
}

impl ReloadOutcome {
    pub fn version(&self) -> u64 {
        match self {
            Self::Updated { to, .. } => *to,
            Self::Unchanged { version } => *version,
        }
    }
}

/// Holds the active RuleSet
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
    /// Serialises reloads so versions stay monotonic
    reload_lock: Mutex<()>,
}

impl RuleStore {
    /// Store with an already-parsed RuleSet as version 1
    pub fn new(mut initial: RuleSet) -> Self {
        initial.version = 1;
        Self {
            current: ArcSwap::from_pointee(initial),
            reload_lock: Mutex::new(()),
        }
    }

    /// Parse a document and make it version 1
    pub fn from_document(raw: &str, source: Option<&Path>) -> Result<Self, PolicyParseError> {
        Ok(Self::new(load_with_source(raw, source)?))
    }

    /// Latest committed RuleSet
    pub fn current(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Replace the active RuleSet. On error the active set is untouched.
    pub fn reload(&self, raw: &str) -> Result<ReloadOutcome, PolicyParseError> {
        let source = self.current.load().source.clone();
        self.reload_with_source(raw, source.as_deref())
    }

    pub fn reload_with_source(
        &self,
        raw: &str,
        source: Option<&Path>,
    ) -> Result<ReloadOutcome, PolicyParseError> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let active = self.current.load_full();

        if digest(raw) == active.digest {
            return Ok(ReloadOutcome::Unchanged {
                version: active.version,
            });
        }

        let mut next = match load_with_source(raw, source) {
            Ok(set) => set,
            Err(e) => {
                warn!(version = active.version, error = %e, "policy reload rejected, keeping active rules");
                return Err(e);
            }
        };
        next.version = active.version + 1;
        let to = next.version;
        let rules = next.rule_count();
        self.current.store(Arc::new(next));

        info!(from = active.version, to, rules, "policy reloaded");
        Ok(ReloadOutcome::Updated {
            from: active.version,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Action;
    use crate::matcher::evaluate;
    use crate::operation::{OperationDescriptor, Target};

    const V1: &str = "command_rules:\n  - name: no-curl\n    commands: [curl]\n    decision: deny\n";
    const V2: &str = "command_rules:\n  - name: curl-ok\n    commands: [curl]\n    decision: allow\n";
    const BROKEN: &str = "command_rules:\n  - name: curl-ok\n    commands: [curl]\n    decision: allow\n  - name: oops\n    commands: [wget]\n    decision: sometimes\n";

    #[test]
    fn test_reload_swaps_version() {
        let store = RuleStore::from_document(V1, None).unwrap();
        assert_eq!(store.version(), 1);

        let outcome = store.reload(V2).unwrap();
        assert_eq!(outcome, ReloadOutcome::Updated { from: 1, to: 2 });

        let op = OperationDescriptor::new("s", "a", Target::command("curl", &[]));
        assert_eq!(evaluate(&op, &store.current()).action, Action::Allow);
    }

    #[test]
    fn test_same_document_is_noop() {
        let store = RuleStore::from_document(V1, None).unwrap();
        assert_eq!(store.reload(V1).unwrap(), ReloadOutcome::Unchanged { version: 1 });
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_invalid_reload_keeps_previous() {
        let store = RuleStore::from_document(V1, None).unwrap();
        let before = store.current();

        let err = store.reload(BROKEN).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("oops"));

        let after = store.current();
        assert_eq!(after.version, 1);
        assert_eq!(after.digest, before.digest);
        assert_eq!(after.command_rules[0].name, "no-curl");
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let store = RuleStore::from_document(V1, None).unwrap();
        let snapshot = store.current();
        store.reload(V2).unwrap();
        assert_eq!(snapshot.command_rules[0].name, "no-curl");
        assert_eq!(store.current().command_rules[0].name, "curl-ok");
    }

    #[test]
    fn test_concurrent_readers_see_whole_versions() {
        let store = Arc::new(RuleStore::from_document(V1, None).unwrap());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let set = store.current();
                        let name = &set.command_rules[0].name;
                        match set.version % 2 {
                            1 => assert_eq!(name, "no-curl"),
                            _ => assert_eq!(name, "curl-ok"),
                        }
                    }
                })
            })
            .collect();

        for i in 0..50 {
            let doc = if i % 2 == 0 { V2 } else { V1 };
            store.reload(doc).unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
