//! Hosted resource limit monitor
//!
//! The limits themselves are applied by whatever hosts the sandbox (a cgroup
//! v2 slice). The gateway only watches the cgroup event counters and reports
//! when one moves.

use crate::engine::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Counters watched, as (file, key, metric label)
const WATCHED: &[(&str, &str, &str)] = &[
    ("memory.events", "oom_kill", "memory_oom_kill"),
    ("memory.events", "max", "memory_max"),
    ("pids.events", "max", "pids_max"),
];

/// A counter that increased since the previous poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitTrip {
    pub limit: &'static str,
    pub count: u64,
    pub delta: u64,
}

pub struct LimitMonitor {
    root: PathBuf,
    last: HashMap<&'static str, u64>,
}

impl LimitMonitor {
    /// Monitor rooted at a cgroup directory. The current counter values
    /// become the baseline.
    pub fn new(root: &Path) -> Self {
        let mut monitor = Self {
            root: root.to_path_buf(),
            last: HashMap::new(),
        };
        monitor.poll();
        monitor
    }

    /// Whether any watched counter file exists under the root
    pub fn available(&self) -> bool {
        WATCHED.iter().any(|(file, _, _)| self.root.join(file).is_file())
    }

    /// Read the counters and return the ones that went up
    pub fn poll(&mut self) -> Vec<LimitTrip> {
        let mut files: HashMap<&str, HashMap<String, u64>> = HashMap::new();
        let mut trips = Vec::new();

        for &(file, key, label) in WATCHED {
            let values = files.entry(file).or_insert_with(|| read_events(&self.root.join(file)));
            let Some(&count) = values.get(key) else {
                continue;
            };
            let previous = self.last.insert(label, count);
            if let Some(previous) = previous {
                if count > previous {
                    trips.push(LimitTrip {
                        limit: label,
                        count,
                        delta: count - previous,
                    });
                }
            }
        }
        trips
    }

    /// Poll every `limits.poll_interval` until `shutdown` fires
    pub async fn run(mut self, engine: Arc<Engine>, shutdown: CancellationToken) {
        if !self.available() {
            debug!(root = %self.root.display(), "no cgroup event counters, limit monitor idle");
            return;
        }
        let mut interval = tokio::time::interval(engine.config().limits.poll_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for trip in self.poll() {
                        report(&engine, &trip).await;
                    }
                }
            }
        }
    }
}

async fn report(engine: &Engine, trip: &LimitTrip) {
    warn!(limit = trip.limit, count = trip.count, delta = trip.delta, "resource limit hit");
    engine.metrics().limit_event(trip.limit);
    let detail = format!("{} +{} (total {})", trip.limit, trip.delta, trip.count);
    engine
        .record_control("limit", &detail, true, "hosted resource limit reached")
        .await;
}

/// Parse a cgroup `*.events` file: one `key value` pair per line
fn read_events(path: &Path) -> HashMap<String, u64> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::engine_with_policy;
    use audit::AuditQuery;
    use tempfile::tempdir;

    fn write_memory(dir: &Path, max: u64, oom_kill: u64) {
        std::fs::write(
            dir.join("memory.events"),
            format!("low 0\nhigh 0\nmax {}\noom {}\noom_kill {}\n", max, oom_kill, oom_kill),
        )
        .unwrap();
    }

    #[test]
    fn test_baseline_then_increase() {
        let dir = tempdir().unwrap();
        write_memory(dir.path(), 4, 1);
        std::fs::write(dir.path().join("pids.events"), "max 0\n").unwrap();

        let mut monitor = LimitMonitor::new(dir.path());
        assert!(monitor.available());
        assert!(monitor.poll().is_empty());

        write_memory(dir.path(), 4, 3);
        std::fs::write(dir.path().join("pids.events"), "max 1\n").unwrap();
        let trips = monitor.poll();
        assert_eq!(
            trips,
            vec![
                LimitTrip {
                    limit: "memory_oom_kill",
                    count: 3,
                    delta: 2
                },
                LimitTrip {
                    limit: "pids_max",
                    count: 1,
                    delta: 1
                },
            ]
        );
        assert!(monitor.poll().is_empty());
    }

    #[test]
    fn test_missing_cgroup_files() {
        let dir = tempdir().unwrap();
        let mut monitor = LimitMonitor::new(dir.path());
        assert!(!monitor.available());
        assert!(monitor.poll().is_empty());
    }

    #[test]
    fn test_read_events_skips_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pids.events");
        std::fs::write(&path, "max 7\nbroken\nother x\n").unwrap();
        let values = read_events(&path);
        assert_eq!(values.len(), 1);
        assert_eq!(values["max"], 7);
    }

    #[tokio::test]
    async fn test_report_counts_and_audits() {
        let (engine, _dir) = engine_with_policy("version: 1\n");
        let trip = LimitTrip {
            limit: "memory_max",
            count: 5,
            delta: 2,
        };
        report(&engine, &trip).await;

        assert_eq!(engine.metrics().limit_events_for("memory_max"), 1);
        let events = engine
            .query_audit(AuditQuery {
                kind: Some(policy::OperationKind::Control),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
