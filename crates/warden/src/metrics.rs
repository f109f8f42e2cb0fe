//! Gateway counters, rendered in Prometheus text exposition format

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// A counter family keyed by label values
struct CounterVec {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    values: Mutex<BTreeMap<Vec<String>, u64>>,
}

impl CounterVec {
    const fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            labels,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    fn inc(&self, label_values: &[&str]) {
        let key = label_values.iter().map(|v| v.to_string()).collect();
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        *values.entry(key).or_insert(0) += 1;
    }

    fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(&key).copied().unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in values.iter() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .zip(key.iter())
                .map(|(name, v)| format!("{}=\"{}\"", name, escape(v)))
                .collect();
            let _ = writeln!(out, "{}{{{}}} {}", self.name, labels.join(","), value);
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Point-in-time values owned by other components
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub approvals_pending: usize,
    pub audit_degraded: bool,
    pub audit_write_failures: u64,
    pub policy_version: u64,
}

pub struct Metrics {
    decisions: CounterVec,
    outcomes: CounterVec,
    approvals_resolved: CounterVec,
    reloads: CounterVec,
    limit_events: CounterVec,
    quarantine_moves: AtomicU64,
    redactions: AtomicU64,
    proxy_active: AtomicI64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            decisions: CounterVec::new(
                "warden_decisions_total",
                "Matcher decisions by operation kind and action",
                &["kind", "action"],
            ),
            outcomes: CounterVec::new(
                "warden_outcomes_total",
                "Final operation outcomes by kind",
                &["kind", "outcome"],
            ),
            approvals_resolved: CounterVec::new(
                "warden_approvals_resolved_total",
                "Approval requests by terminal state",
                &["state"],
            ),
            reloads: CounterVec::new(
                "warden_policy_reloads_total",
                "Policy reload attempts by result",
                &["result"],
            ),
            limit_events: CounterVec::new(
                "warden_limit_events_total",
                "Hosted resource limit trips observed",
                &["limit"],
            ),
            quarantine_moves: AtomicU64::new(0),
            redactions: AtomicU64::new(0),
            proxy_active: AtomicI64::new(0),
        }
    }

    pub fn decision(&self, kind: &str, action: &str) {
        self.decisions.inc(&[kind, action]);
    }

    pub fn outcome(&self, kind: &str, outcome: &str) {
        self.outcomes.inc(&[kind, outcome]);
    }

    pub fn approval_resolved(&self, state: &str) {
        self.approvals_resolved.inc(&[state]);
    }

    pub fn reload(&self, result: &str) {
        self.reloads.inc(&[result]);
    }

    pub fn limit_event(&self, limit: &str) {
        self.limit_events.inc(&[limit]);
    }

    pub fn quarantine_move(&self) {
        self.quarantine_moves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redacted(&self, count: usize) {
        if count > 0 {
            self.redactions.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn proxy_opened(&self) {
        self.proxy_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proxy_closed(&self) {
        self.proxy_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn decisions_for(&self, kind: &str, action: &str) -> u64 {
        self.decisions.get(&[kind, action])
    }

    pub fn outcomes_for(&self, kind: &str, outcome: &str) -> u64 {
        self.outcomes.get(&[kind, outcome])
    }

    pub fn limit_events_for(&self, limit: &str) -> u64 {
        self.limit_events.get(&[limit])
    }

    pub fn redactions(&self) -> u64 {
        self.redactions.load(Ordering::Relaxed)
    }

    pub fn quarantine_moves(&self) -> u64 {
        self.quarantine_moves.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn render(&self, snapshot: &Snapshot) -> String {
        let mut out = String::new();
        self.decisions.render(&mut out);
        self.outcomes.render(&mut out);
        gauge(
            &mut out,
            "warden_approvals_pending",
            "Approval requests waiting for an approver",
            snapshot.approvals_pending,
        );
        self.approvals_resolved.render(&mut out);
        counter(
            &mut out,
            "warden_audit_write_failures_total",
            "Audit store writes that failed",
            snapshot.audit_write_failures,
        );
        gauge(
            &mut out,
            "warden_audit_degraded",
            "1 while audit events are spilling instead of being stored",
            u8::from(snapshot.audit_degraded),
        );
        self.reloads.render(&mut out);
        gauge(
            &mut out,
            "warden_policy_version",
            "Version of the active rule set",
            snapshot.policy_version,
        );
        counter(
            &mut out,
            "warden_quarantine_moves_total",
            "Files moved to quarantine instead of deleted",
            self.quarantine_moves(),
        );
        counter(
            &mut out,
            "warden_redactions_total",
            "Sensitive spans masked in agent-visible output",
            self.redactions(),
        );
        gauge(
            &mut out,
            "warden_proxy_connections_active",
            "Proxied connections currently open",
            self.proxy_active.load(Ordering::Relaxed),
        );
        self.limit_events.render(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_labels_and_gauges() {
        let metrics = Metrics::new();
        metrics.decision("network", "deny");
        metrics.decision("network", "deny");
        metrics.outcome("network", "denied");
        metrics.redacted(3);

        let text = metrics.render(&Snapshot {
            approvals_pending: 2,
            audit_degraded: true,
            audit_write_failures: 1,
            policy_version: 4,
        });

        assert!(text.contains("warden_decisions_total{kind=\"network\",action=\"deny\"} 2"));
        assert!(text.contains("warden_outcomes_total{kind=\"network\",outcome=\"denied\"} 1"));
        assert!(text.contains("warden_approvals_pending 2"));
        assert!(text.contains("warden_audit_degraded 1"));
        assert!(text.contains("warden_policy_version 4"));
        assert!(text.contains("warden_redactions_total 3"));
        assert!(text.contains("# TYPE warden_proxy_connections_active gauge"));
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape("a\"b"), "a\\\"b");
    }
}
