//! The decision pipeline
//!
//! Every intercepted operation goes through the same steps:
//!
//! 1. the filesystem floor (file operations only), then the matcher against
//!    the active rule set snapshot
//! 2. for `approve`, a wait on the approval broker, cancelled by session
//!    teardown
//! 3. one audit event, written before the outcome is handed back
//!
//! Interceptors call [`Engine::authorize`], or [`Engine::check`] followed by
//! [`Engine::finish`] when the outcome depends on work done in between (a
//! quarantine move, a command run whose output is audited).

use crate::fsguard::{Floor, Quarantine};
use crate::metrics::{Metrics, Snapshot};
use crate::session::{SessionRegistry, ANONYMOUS};
use anyhow::{Context, Result};
use approvals::{ApprovalBroker, ApprovalError, ApprovalOutcome, ApprovalRequest, Resolution};
use audit::{AuditEvent, AuditLog, AuditQuery, AuditStore, Durability, Outcome, Spool, StorageError};
use chrono::{DateTime, Utc};
use dlp::Redactor;
use policy::{
    evaluate, Action, Decision, OperationDescriptor, PolicyParseError, Reason, ReloadOutcome, RuleSet, RuleStore,
    Target, DEFAULT_POLICY,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::config::LimitsConfig;
use warden_core::{Paths, ServerConfig};

/// Who is asking
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Caller {
    pub session: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl Caller {
    pub fn new(session: impl Into<String>, actor: impl Into<String>) -> Self {
        let session = session.into();
        Self {
            session: if session.is_empty() { ANONYMOUS.to_string() } else { session },
            actor: actor.into(),
            cwd: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, ANONYMOUS)
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn descriptor(&self, target: Target) -> OperationDescriptor {
        OperationDescriptor::new(self.session.clone(), self.actor.clone(), target)
    }
}

/// A decided operation whose audit event has not been written yet
#[derive(Debug)]
pub struct Pending {
    pub operation: OperationDescriptor,
    pub decision: Decision,
    /// Final state of the approval the operation waited on
    pub approval: Option<ApprovalRequest>,
    allowed: bool,
    refusal: Option<String>,
    notes: Vec<String>,
    output: Option<String>,
    run_time: Option<Duration>,
}

impl Pending {
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Turn an allowed operation into a denial (the enforcing step failed)
    pub fn refuse(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.allowed = false;
        self.notes.push(reason.clone());
        self.refusal = Some(reason);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Redacted output to keep with the audit event
    pub fn capture(&mut self, output: impl Into<String>, run_time: Duration) {
        self.output = Some(output.into());
        self.run_time = Some(run_time);
    }
}

/// Final, audited outcome of one operation
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub operation: OperationDescriptor,
    pub decision: Decision,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
    pub audit_id: Uuid,
    #[serde(skip)]
    pub durability: Durability,
    #[serde(skip_serializing_if = "Option::is_none")]
    refusal: Option<String>,
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        self.outcome.is_allowed()
    }

    /// Agent-visible denial text: rule name and message, never internals
    pub fn signal(&self) -> String {
        if let Some(ref refusal) = self.refusal {
            return format!("warden: blocked by policy: {}", refusal);
        }
        let base = self.decision.denial_signal();
        match self.approval.as_ref().map(|a| a.state) {
            Some(approvals::ApprovalState::Denied) => format!("warden: {} (approval denied)", base),
            Some(approvals::ApprovalState::Expired) => format!("warden: {} (approval expired)", base),
            _ => format!("warden: {}", base),
        }
    }

    pub fn rule(&self) -> Option<&str> {
        self.decision.matched_rule.as_deref()
    }
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to read policy {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] PolicyParseError),
}

/// Gateway status, as reported by `status` and `warden status`
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub policy_version: u64,
    pub policy_digest: String,
    pub policy_source: Option<PathBuf>,
    pub policy_loaded_at: DateTime<Utc>,
    pub rules: usize,
    pub approvals_pending: usize,
    pub sessions: usize,
    pub audit_degraded: bool,
    pub audit_write_failures: u64,
    pub backends: Vec<String>,
    pub limits: LimitsConfig,
}

pub struct Engine {
    config: ServerConfig,
    policy_path: PathBuf,
    rules: RuleStore,
    approvals: ApprovalBroker,
    audit: AuditLog,
    redactor: Arc<Redactor>,
    sessions: SessionRegistry,
    metrics: Metrics,
    floor: Floor,
    quarantine: Quarantine,
    backends: Mutex<Vec<String>>,
}

impl Engine {
    /// Open the gateway state: policy, audit store, quarantine
    pub fn open(config: ServerConfig, paths: &Paths) -> Result<Self> {
        let policy_path = config.policy_path(paths);
        let rules = if policy_path.exists() {
            let raw = std::fs::read_to_string(&policy_path)
                .with_context(|| format!("Failed to read policy from {:?}", policy_path))?;
            RuleStore::from_document(&raw, Some(&policy_path))
                .with_context(|| format!("Invalid policy {:?}", policy_path))?
        } else {
            info!(path = %policy_path.display(), "no policy file, using the bundled default policy");
            RuleStore::from_document(DEFAULT_POLICY, None).context("Bundled default policy is invalid")?
        };

        let audit_path = config.audit_path(paths);
        let store = AuditStore::open(&audit_path)
            .with_context(|| format!("Failed to open audit store at {:?}", audit_path))?;
        let spill_path = config.spill_path(paths);
        let audit = AuditLog::new(store, Spool::new(spill_path.clone()));

        let redactor = Redactor::from_config(&config.dlp).context("Invalid redaction pattern in config")?;

        let quarantine_root = config.quarantine_root(paths);
        let quarantine = Quarantine::open(&quarantine_root)
            .with_context(|| format!("Failed to open quarantine at {:?}", quarantine_root))?;

        let mut floor = Floor::builtin()
            .protect(&audit_path)
            .protect(&spill_path)
            .protect(&quarantine_root)
            .protect(&policy_path)
            .protect(&paths.config_file())
            .protect(&config.socket_path(paths));
        if let Some(ref socket) = config.operator_socket_path(paths) {
            floor = floor.protect(socket);
        }

        let approvals = ApprovalBroker::new(config.approvals.default_timeout);

        let engine = Self {
            config,
            policy_path,
            rules,
            approvals,
            audit,
            redactor: Arc::new(redactor),
            sessions: SessionRegistry::new(),
            metrics: Metrics::new(),
            floor,
            quarantine,
            backends: Mutex::new(Vec::new()),
        };

        let set = engine.rules.current();
        info!(
            version = set.version,
            digest = set.short_digest(),
            rules = set.rule_count(),
            "policy active"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.current()
    }

    pub fn approvals(&self) -> &ApprovalBroker {
        &self.approvals
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn redactor(&self) -> Arc<Redactor> {
        self.redactor.clone()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn floor(&self) -> &Floor {
        &self.floor
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    /// Record which enforcement backends are running
    pub fn set_backends(&self, names: Vec<String>) {
        *self.backends.lock().unwrap_or_else(|e| e.into_inner()) = names;
    }

    /// Decision for an operation without waiting, auditing or counting.
    /// The filesystem floor is consulted before any rule.
    pub fn evaluate(&self, operation: &OperationDescriptor) -> Decision {
        let set = self.rules.current();
        if let Target::File { path, operation: op } = &operation.target {
            if let Some(decision) = self.floor.check(path, *op, set.version) {
                return decision;
            }
        }
        evaluate(operation, &set)
    }

    /// Decide an operation, waiting on an approver when the policy says so
    pub async fn check(&self, operation: OperationDescriptor) -> Pending {
        let token = self.sessions.token(&operation.session_id);
        let decision = self.evaluate(&operation);
        let kind = operation.kind();
        self.metrics.decision(kind.as_str(), decision.action.as_str());

        debug!(
            operation = %operation.id,
            session = %operation.session_id,
            kind = %kind,
            action = %decision.action,
            rule = decision.matched_rule.as_deref().unwrap_or("-"),
            "decided: {}",
            operation.target.summary()
        );

        let (allowed, approval) = match decision.action {
            Action::Allow => (true, None),
            Action::Deny => (false, None),
            Action::Approve => {
                let request = self.approvals.request(&operation, &decision);
                let outcome = match self.approvals.await_resolution(request.id, &token).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(approval = %request.id, error = %e, "approval wait failed, denying");
                        ApprovalOutcome::Denied
                    }
                };
                self.metrics.approval_resolved(outcome.state().as_str());
                let settled = self.approvals.get(request.id).unwrap_or(request);
                (outcome.allowed(), Some(settled))
            }
        };

        Pending {
            operation,
            decision,
            approval,
            allowed,
            refusal: None,
            notes: Vec::new(),
            output: None,
            run_time: None,
        }
    }

    /// Audit a decided operation and return its final verdict. When the
    /// event cannot be made durable anywhere the operation is denied.
    pub async fn finish(&self, pending: Pending) -> Verdict {
        let Pending {
            operation,
            decision,
            approval,
            mut allowed,
            mut refusal,
            notes,
            output,
            run_time,
        } = pending;

        let outcome = if allowed { Outcome::Allowed } else { Outcome::Denied };
        let mut event = AuditEvent::new(operation.clone(), decision.clone(), outcome);
        if let Some(ref request) = approval {
            event = event.with_approval(request.id, request.state, request.resolved_by.clone());
        }
        for note in notes {
            event = event.with_note(note);
        }
        if let Some(output) = output {
            event = event.with_output(output);
        }
        // Without a measured run time, time from interception to resolution
        let run_time = run_time.unwrap_or_else(|| (Utc::now() - operation.timestamp).to_std().unwrap_or_default());
        event = event.with_duration(run_time);

        let durability = self.audit.record(&event).await;
        if !durability.is_durable() && allowed {
            allowed = false;
            refusal = Some("audit log unavailable".to_string());
        }
        let outcome = if allowed { Outcome::Allowed } else { Outcome::Denied };

        let kind = operation.kind();
        self.metrics.outcome(kind.as_str(), outcome.as_str());
        if outcome == Outcome::Denied {
            info!(
                operation = %operation.id,
                session = %operation.session_id,
                kind = %kind,
                rule = decision.matched_rule.as_deref().unwrap_or("-"),
                reason = %decision.reason.as_str(),
                "denied: {}",
                operation.target.summary()
            );
        }

        Verdict {
            operation,
            decision,
            outcome,
            approval,
            audit_id: event.id,
            durability,
            refusal,
        }
    }

    /// Decide, wait and audit in one step
    pub async fn authorize(&self, operation: OperationDescriptor) -> Verdict {
        let pending = self.check(operation).await;
        self.finish(pending).await
    }

    /// Refuse an operation that cannot be evaluated at all (unparseable input)
    pub async fn deny(&self, operation: OperationDescriptor, message: &str) -> Verdict {
        let mut decision = Decision::new(Action::Deny, Reason::Default, message);
        decision.ruleset_version = self.rules.version();
        self.metrics.decision(operation.kind().as_str(), decision.action.as_str());
        self.finish(Pending {
            operation,
            decision,
            approval: None,
            allowed: false,
            refusal: None,
            notes: Vec::new(),
            output: None,
            run_time: None,
        })
        .await
    }

    /// Audit an event the gateway itself produced (reloads, limit trips)
    pub async fn record_control(&self, action: &str, detail: &str, allowed: bool, message: &str) -> Durability {
        let operation = Caller::new("warden", "warden").descriptor(Target::Control {
            action: action.to_string(),
            detail: detail.to_string(),
        });
        let mut decision = Decision::new(
            if allowed { Action::Allow } else { Action::Deny },
            Reason::Default,
            message,
        );
        decision.ruleset_version = self.rules.version();
        let outcome = if allowed { Outcome::Allowed } else { Outcome::Denied };
        self.audit.record(&AuditEvent::new(operation, decision, outcome)).await
    }

    /// Re-read the policy file and swap it in. A bad document leaves the
    /// active rule set in place.
    pub async fn reload_policy(&self) -> Result<ReloadOutcome, ReloadError> {
        let (raw, source) = if self.policy_path.exists() {
            let raw = std::fs::read_to_string(&self.policy_path).map_err(|source| ReloadError::Read {
                path: self.policy_path.clone(),
                source,
            })?;
            (raw, Some(self.policy_path.clone()))
        } else {
            (DEFAULT_POLICY.to_string(), None)
        };
        self.reload_document(&raw, source.as_deref()).await
    }

    /// Swap in a policy document
    pub async fn reload_document(&self, raw: &str, source: Option<&Path>) -> Result<ReloadOutcome, ReloadError> {
        let detail = source.map(|p| p.display().to_string()).unwrap_or_else(|| "inline".to_string());
        match self.rules.reload_with_source(raw, source) {
            Ok(outcome) => {
                let result = match outcome {
                    ReloadOutcome::Updated { .. } => "updated",
                    ReloadOutcome::Unchanged { .. } => "unchanged",
                };
                self.metrics.reload(result);
                if let ReloadOutcome::Updated { from, to } = outcome {
                    self.record_control(
                        "policy.reload",
                        &detail,
                        true,
                        &format!("policy version {} -> {}", from, to),
                    )
                    .await;
                }
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.reload("error");
                self.record_control("policy.reload", &detail, false, &e.to_string()).await;
                Err(ReloadError::Parse(e))
            }
        }
    }

    /// Resolve an approval on behalf of an approver
    pub fn resolve_approval(
        &self,
        id: Uuid,
        resolution: Resolution,
        approver: &str,
        note: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.approvals.resolve(id, resolution, approver, note)
    }

    /// Tear down a session: pending approvals expire and waits are released
    pub fn end_session(&self, session_id: &str) -> Vec<ApprovalRequest> {
        let expired = self.approvals.cancel_session(session_id);
        let known = self.sessions.end(session_id);
        info!(session = session_id, known, expired = expired.len(), "session ended");
        expired
    }

    pub async fn query_audit(&self, query: AuditQuery) -> Result<Vec<AuditEvent>, StorageError> {
        self.audit.query(query).await
    }

    /// Housekeeping: audit retention, resolved approvals, quarantine purge
    pub async fn sweep(&self) {
        let protected = self.approvals.pending_refs();
        if let Err(e) = self.audit.sweep(self.config.audit.retention_days, protected).await {
            warn!(error = %e, "audit retention sweep failed");
        }

        let pruned = self.approvals.prune();
        if pruned > 0 {
            debug!(pruned, "pruned resolved approvals");
        }

        let waiting: HashSet<String> = self
            .approvals
            .pending()
            .into_iter()
            .map(|r| r.operation.session_id)
            .collect();
        let forgotten = self.sessions.prune_idle(crate::session::IDLE_AFTER, &waiting);
        if forgotten > 0 {
            debug!(forgotten, "forgot idle sessions");
        }

        let days = self.config.quarantine.purge_after_days;
        if days > 0 {
            let age = Duration::from_secs(u64::from(days) * 24 * 3600);
            match self.quarantine.purge(age) {
                Ok(purged) if !purged.is_empty() => info!(purged = purged.len(), "quarantine purged"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "quarantine purge failed"),
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            approvals_pending: self.approvals.pending_count(),
            audit_degraded: self.audit.is_degraded(),
            audit_write_failures: self.audit.write_failures(),
            policy_version: self.rules.version(),
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render(&self.snapshot())
    }

    /// Reasons the gateway is not ready; empty when it is
    pub fn not_ready(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.rules.version() == 0 {
            reasons.push("no active rule set".to_string());
        }
        if self.audit.is_degraded() {
            reasons.push("audit log degraded".to_string());
        }
        reasons
    }

    pub fn status(&self) -> Status {
        let set = self.rules.current();
        Status {
            version: env!("CARGO_PKG_VERSION"),
            policy_version: set.version,
            policy_digest: set.short_digest().to_string(),
            policy_source: set.source.clone(),
            policy_loaded_at: set.loaded_at,
            rules: set.rule_count(),
            approvals_pending: self.approvals.pending_count(),
            sessions: self.sessions.len(),
            audit_degraded: self.audit.is_degraded(),
            audit_write_failures: self.audit.write_failures(),
            backends: self.backends.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            limits: self.config.limits.clone(),
        }
    }
}
