//! RPC method dispatch
//!
//! Check methods (`command.check`, `command.check_line`, `net.check`) return
//! the audited verdict as their result whatever the outcome. Action methods
//! (`command.exec`, `fs.*`) fail with the policy-denied code when refused,
//! carrying the verdict as error data.

use super::protocol::*;
use crate::command::ExecError;
use crate::engine::{Caller, Engine, ReloadError, Verdict};
use crate::fsguard::{FsError, QuarantineError};
use approvals::Resolution;
use audit::AuditQuery;
use base64::Engine as _;
use policy::{ReloadOutcome, Target, Transport};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identity fields accepted by every method acting for a session
#[derive(Debug, Default, Deserialize)]
struct CallerParams {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

impl CallerParams {
    fn caller(&self) -> Caller {
        let caller = Caller::new(
            self.session.clone().unwrap_or_default(),
            self.actor.clone().unwrap_or_else(|| "agent".to_string()),
        );
        match self.cwd {
            Some(ref cwd) => caller.with_cwd(cwd),
            None => caller,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(flatten)]
    caller: CallerParams,
}

#[derive(Debug, Deserialize)]
struct LineParams {
    line: String,
    #[serde(flatten)]
    caller: CallerParams,
}

#[derive(Debug, Deserialize)]
struct NetParams {
    host: String,
    port: u16,
    #[serde(default = "default_transport")]
    transport: Transport,
    #[serde(flatten)]
    caller: CallerParams,
}

fn default_transport() -> Transport {
    Transport::Tcp
}

#[derive(Debug, Deserialize)]
struct FileParams {
    path: PathBuf,
    /// Write payload; base64 unless `encoding` is `utf8`
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(flatten)]
    caller: CallerParams,
}

#[derive(Debug, Deserialize)]
struct EvaluateParams {
    target: Target,
    #[serde(flatten)]
    caller: CallerParams,
}

#[derive(Debug, Default, Deserialize)]
struct ReloadParams {
    /// Inline policy document; the policy file is re-read when absent
    #[serde(default)]
    document: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QuarantineListParams {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RestoreParams {
    id: Uuid,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, Default, Deserialize)]
struct PurgeParams {
    /// Human duration (`7d`, `12h`); the configured age when absent
    #[serde(default)]
    older_than: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApprovalListParams {
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    id: Uuid,
    decision: String,
    #[serde(default)]
    approver: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    #[serde(default)]
    since: Option<chrono::DateTime<chrono::Utc>>,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

/// Like [`parse`], but a missing params object means all defaults
fn parse_or_default<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| RpcError::InvalidParams(e.to_string())),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(format!("Serialization error: {}", e)))
}

fn denied(verdict: &Verdict) -> RpcError {
    RpcError::Denied {
        message: verdict.signal(),
        verdict: serde_json::to_value(verdict).unwrap_or(Value::Null),
    }
}

fn verdict_result(verdict: &Verdict) -> Result<Value, RpcError> {
    Ok(json!({
        "allowed": verdict.allowed(),
        "signal": if verdict.allowed() { Value::Null } else { Value::from(verdict.signal()) },
        "verdict": to_value(verdict)?,
    }))
}

fn fs_error(e: FsError) -> RpcError {
    match e {
        FsError::Denied(verdict) => denied(&verdict),
        FsError::Io { .. } => RpcError::Internal(e.to_string()),
    }
}

fn quarantine_error(e: QuarantineError) -> RpcError {
    match e {
        QuarantineError::NotFound(_) => RpcError::NotFound(e.to_string()),
        QuarantineError::Conflict(_) => RpcError::InvalidParams(e.to_string()),
        other => RpcError::Internal(other.to_string()),
    }
}

/// Methods served to agents. Everything else acts on the gateway itself
/// and is only served to operators.
pub const AGENT_METHODS: &[&str] = &[
    "ping",
    "status",
    "policy.version",
    "policy.evaluate",
    "command.check",
    "command.check_line",
    "command.exec",
    "net.check",
    "fs.read",
    "fs.write",
    "fs.delete",
];

/// Who is on the other end of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Shims and agent tooling inside the sandbox
    Agent,
    /// Operator CLI and the control surface
    Operator,
}

/// Dispatches JSON-RPC requests onto the engine
#[derive(Clone)]
pub struct RpcHandler {
    engine: Arc<Engine>,
    scope: Scope,
}

impl RpcHandler {
    /// Every method, for operator transports
    pub fn operator(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            scope: Scope::Operator,
        }
    }

    /// Only [`AGENT_METHODS`], for the socket the shims use
    pub fn agent(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            scope: Scope::Agent,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Handle one raw message; `None` for notifications
    pub async fn handle_message(&self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                return Some(JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e)));
            }
        };
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id,
                INVALID_REQUEST,
                "Invalid request: jsonrpc must be \"2.0\"".to_string(),
            ));
        }

        let id = request.id.clone();
        let result = self.dispatch(&request.method, request.params).await;

        // Notifications get no response
        id.as_ref()?;
        match result {
            Ok(value) => Some(JsonRpcResponse::success(id, value)),
            Err(e) => {
                debug!(method = %request.method, code = e.code(), error = %e, "rpc call failed");
                Some(e.into_response(id))
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        if self.scope == Scope::Agent && !AGENT_METHODS.contains(&method) {
            warn!(method, "operator method refused on the agent socket");
            return Err(RpcError::OperatorOnly(method.to_string()));
        }
        match method {
            "status" => to_value(&self.engine.status()),
            "policy.version" => self.policy_version(),
            "policy.reload" => self.policy_reload(parse_or_default(params)?).await,
            "policy.evaluate" => self.policy_evaluate(parse(params)?),
            "command.check" => self.command_check(parse(params)?).await,
            "command.check_line" => self.command_check_line(parse(params)?).await,
            "command.exec" => self.command_exec(parse(params)?).await,
            "net.check" => self.net_check(parse(params)?).await,
            "fs.read" => self.fs_read(parse(params)?).await,
            "fs.write" => self.fs_write(parse(params)?).await,
            "fs.delete" => self.fs_delete(parse(params)?).await,
            "quarantine.list" => self.quarantine_list(parse_or_default(params)?),
            "quarantine.restore" => self.quarantine_restore(parse(params)?).await,
            "quarantine.purge" => self.quarantine_purge(parse_or_default(params)?).await,
            "approval.list" => self.approval_list(parse_or_default(params)?),
            "approval.resolve" => self.approval_resolve(parse(params)?),
            "session.end" => self.session_end(parse(params)?),
            "audit.query" => self.audit_query(parse_or_default(params)?).await,
            "audit.stats" => self.audit_stats(parse_or_default(params)?).await,
            "ping" => Ok(json!({})),
            _ => {
                warn!("Unknown method: {}", method);
                Err(RpcError::MethodNotFound(method.to_string()))
            }
        }
    }

    fn policy_version(&self) -> Result<Value, RpcError> {
        let set = self.engine.rules();
        Ok(json!({
            "version": set.version,
            "digest": set.digest,
            "loaded_at": set.loaded_at,
            "source": set.source,
            "rules": set.rule_count(),
        }))
    }

    async fn policy_reload(&self, params: ReloadParams) -> Result<Value, RpcError> {
        let result = match params.document {
            Some(ref raw) => self.engine.reload_document(raw, None).await,
            None => self.engine.reload_policy().await,
        };
        match result {
            Ok(ReloadOutcome::Updated { from, to }) => {
                info!(from, to, "policy reloaded over rpc");
                Ok(json!({"outcome": "updated", "from": from, "version": to}))
            }
            Ok(ReloadOutcome::Unchanged { version }) => Ok(json!({"outcome": "unchanged", "version": version})),
            Err(ReloadError::Parse(e)) => Err(RpcError::InvalidParams(e.to_string())),
            Err(e) => Err(RpcError::Internal(e.to_string())),
        }
    }

    fn policy_evaluate(&self, params: EvaluateParams) -> Result<Value, RpcError> {
        let operation = params.caller.caller().descriptor(params.target);
        to_value(&self.engine.evaluate(&operation))
    }

    async fn command_check(&self, params: CommandParams) -> Result<Value, RpcError> {
        let verdict = self
            .engine
            .check_command(&params.caller.caller(), &params.program, &params.args)
            .await;
        verdict_result(&verdict)
    }

    async fn command_check_line(&self, params: LineParams) -> Result<Value, RpcError> {
        to_value(&self.engine.check_line(&params.caller.caller(), &params.line).await)
    }

    async fn command_exec(&self, params: CommandParams) -> Result<Value, RpcError> {
        let timeout = params.timeout_ms.map(Duration::from_millis);
        match self
            .engine
            .exec_command(&params.caller.caller(), &params.program, &params.args, timeout)
            .await
        {
            Ok(output) => to_value(&output),
            Err(ExecError::Denied(verdict)) => Err(denied(&verdict)),
            Err(e) => Err(RpcError::Internal(e.to_string())),
        }
    }

    async fn net_check(&self, params: NetParams) -> Result<Value, RpcError> {
        let check = self
            .engine
            .authorize_network(&params.caller.caller(), &params.host, params.port, params.transport)
            .await;
        let mut result = verdict_result(&check.verdict)?;
        result["addrs"] = to_value(&check.addrs)?;
        Ok(result)
    }

    async fn fs_read(&self, params: FileParams) -> Result<Value, RpcError> {
        let data = self
            .engine
            .read_file(&params.caller.caller(), &params.path)
            .await
            .map_err(fs_error)?;
        Ok(json!({
            "size": data.len(),
            "encoding": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(&data),
        }))
    }

    async fn fs_write(&self, params: FileParams) -> Result<Value, RpcError> {
        let content = params
            .content
            .as_deref()
            .ok_or_else(|| RpcError::InvalidParams("missing field `content`".to_string()))?;
        let data = match params.encoding.as_deref() {
            Some("utf8") | Some("utf-8") => content.as_bytes().to_vec(),
            Some("base64") | None => base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| RpcError::InvalidParams(format!("content is not base64: {}", e)))?,
            Some(other) => return Err(RpcError::InvalidParams(format!("unknown encoding: {}", other))),
        };
        let written = self
            .engine
            .write_file(&params.caller.caller(), &params.path, &data)
            .await
            .map_err(fs_error)?;
        Ok(json!({ "written": written }))
    }

    async fn fs_delete(&self, params: FileParams) -> Result<Value, RpcError> {
        let entry = self
            .engine
            .delete_file(&params.caller.caller(), &params.path)
            .await
            .map_err(fs_error)?;
        to_value(&entry)
    }

    fn quarantine_list(&self, params: QuarantineListParams) -> Result<Value, RpcError> {
        let quarantine = self.engine.quarantine();
        let entries = match params.path {
            Some(ref path) => quarantine.find_by_path(path),
            None => quarantine.list(params.session.as_deref()),
        }
        .map_err(quarantine_error)?;
        to_value(&entries)
    }

    async fn quarantine_restore(&self, params: RestoreParams) -> Result<Value, RpcError> {
        let entry = self
            .engine
            .quarantine()
            .restore(params.id, params.overwrite)
            .map_err(quarantine_error)?;
        self.engine
            .record_control(
                "quarantine.restore",
                &entry.original_path.display().to_string(),
                true,
                &format!("restored quarantine entry {}", entry.id),
            )
            .await;
        to_value(&entry)
    }

    async fn quarantine_purge(&self, params: PurgeParams) -> Result<Value, RpcError> {
        let age = match params.older_than {
            Some(ref raw) => humantime::parse_duration(raw)
                .map_err(|e| RpcError::InvalidParams(format!("invalid duration {:?}: {}", raw, e)))?,
            None => Duration::from_secs(u64::from(self.engine.config().quarantine.purge_after_days) * 24 * 3600),
        };
        let purged = self.engine.quarantine().purge(age).map_err(quarantine_error)?;
        if !purged.is_empty() {
            self.engine
                .record_control(
                    "quarantine.purge",
                    &humantime::format_duration(age).to_string(),
                    true,
                    &format!("purged {} entries", purged.len()),
                )
                .await;
        }
        to_value(&purged)
    }

    fn approval_list(&self, params: ApprovalListParams) -> Result<Value, RpcError> {
        let approvals = self.engine.approvals();
        if params.all {
            to_value(&approvals.all())
        } else {
            to_value(&approvals.pending())
        }
    }

    fn approval_resolve(&self, params: ResolveParams) -> Result<Value, RpcError> {
        let resolution = Resolution::from_str(&params.decision)
            .ok_or_else(|| RpcError::InvalidParams(format!("unknown decision: {}", params.decision)))?;
        let approver = params.approver.unwrap_or_else(|| "operator".to_string());
        let request = self
            .engine
            .resolve_approval(params.id, resolution, &approver, params.note)?;
        to_value(&request)
    }

    fn session_end(&self, params: SessionParams) -> Result<Value, RpcError> {
        let expired = self.engine.end_session(&params.session);
        Ok(json!({ "session": params.session, "expired": to_value(&expired)? }))
    }

    async fn audit_query(&self, query: AuditQuery) -> Result<Value, RpcError> {
        to_value(&self.engine.query_audit(query).await?)
    }

    async fn audit_stats(&self, params: StatsParams) -> Result<Value, RpcError> {
        to_value(&self.engine.audit().stats(params.since).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::engine_with_policy;

    const POLICY: &str = r#"
version: 1
defaults:
  command: allow
  file: allow
  network: approve
command_rules:
  - name: no-sudo
    commands: [sudo]
    decision: deny
    message: no privilege escalation
"#;

    fn handler() -> (RpcHandler, tempfile::TempDir) {
        let (engine, dir) = engine_with_policy(POLICY);
        (RpcHandler::operator(Arc::new(engine)), dir)
    }

    async fn call(handler: &RpcHandler, method: &str, params: Value) -> JsonRpcResponse {
        handler
            .handle_request(JsonRpcRequest::new(1, method, params))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_parse_error() {
        let (handler, _dir) = handler();
        let response = handler.handle_message("{not json").await.unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (handler, _dir) = handler();
        let response = call(&handler, "nope", Value::Null).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let (handler, _dir) = handler();
        let response = handler
            .handle_message(r#"{"jsonrpc":"2.0","method":"status"}"#)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_command_check() {
        let (handler, _dir) = handler();
        let response = call(
            &handler,
            "command.check",
            json!({"program": "sudo", "args": ["id"], "session": "s1"}),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["allowed"], false);
        assert_eq!(
            result["signal"],
            "warden: blocked by policy rule 'no-sudo': no privilege escalation"
        );
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let (handler, _dir) = handler();
        let response = call(&handler, "command.check", json!({"args": []})).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_fs_roundtrip_and_delete() {
        let (handler, dir) = handler();
        let path = dir.path().join("notes.txt");

        let response = call(
            &handler,
            "fs.write",
            json!({"path": path, "content": "hello", "encoding": "utf8", "session": "s1"}),
        )
        .await;
        assert_eq!(response.result.unwrap()["written"], 5);

        let response = call(&handler, "fs.read", json!({"path": path, "session": "s1"})).await;
        assert_eq!(response.result.unwrap()["content"], "aGVsbG8=");

        let response = call(&handler, "fs.delete", json!({"path": path, "session": "s1"})).await;
        let entry = response.result.unwrap();
        assert!(!path.exists());

        let response = call(&handler, "quarantine.restore", json!({"id": entry["id"]})).await;
        assert!(response.error.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_floor_denial_is_policy_denied_code() {
        let (handler, _dir) = handler();
        let response = call(&handler, "fs.read", json!({"path": "/proc/self/environ"})).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, POLICY_DENIED);
        assert!(error.message.starts_with("warden: blocked by filesystem floor"));
        assert!(error.data.is_some());
    }

    #[tokio::test]
    async fn test_approval_resolve_twice() {
        let (handler, _dir) = handler();
        let engine = handler.engine.clone();
        let waiter = tokio::spawn(async move {
            engine
                .authorize_network(&Caller::new("s1", "agent"), "unknown.invalid", 443, Transport::Https)
                .await
        });

        let id = loop {
            if let Some(request) = handler.engine.approvals().pending().first() {
                break request.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let response = call(
            &handler,
            "approval.resolve",
            json!({"id": id, "decision": "grant", "approver": "alice"}),
        )
        .await;
        assert_eq!(response.result.unwrap()["state"], "granted");
        assert!(waiter.await.unwrap().verdict.allowed());

        let response = call(&handler, "approval.resolve", json!({"id": id, "decision": "deny"})).await;
        assert_eq!(response.error.unwrap().code, ALREADY_RESOLVED);

        let response = call(&handler, "approval.resolve", json!({"id": Uuid::new_v4(), "decision": "deny"})).await;
        assert_eq!(response.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn test_agent_scope_refuses_operator_methods() {
        let (engine, _dir) = engine_with_policy(POLICY);
        let engine = Arc::new(engine);
        let agent = RpcHandler::agent(engine.clone());
        assert_eq!(agent.scope(), Scope::Agent);

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .authorize_network(&Caller::new("s1", "agent"), "unknown.invalid", 443, Transport::Https)
                    .await
            })
        };
        let id = loop {
            if let Some(request) = engine.approvals().pending().first() {
                break request.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let response = call(&agent, "approval.resolve", json!({"id": id, "decision": "grant"})).await;
        assert_eq!(response.error.unwrap().code, OPERATOR_ONLY);
        assert_eq!(engine.approvals().pending().len(), 1);

        for method in ["policy.reload", "quarantine.purge", "session.end", "audit.query", "approval.list"] {
            let response = call(&agent, method, json!({"session": "s1", "document": "version: 1\n"})).await;
            assert_eq!(response.error.unwrap().code, OPERATOR_ONLY, "{}", method);
        }
        assert_eq!(engine.rules().version, 1);
        assert_eq!(engine.approvals().pending().len(), 1);

        let response = call(&agent, "command.check", json!({"program": "ls", "session": "s1"})).await;
        assert_eq!(response.result.unwrap()["allowed"], true);

        engine.end_session("s1");
        assert!(!waiter.await.unwrap().verdict.allowed());
    }

    #[tokio::test]
    async fn test_reload_inline_error() {
        let (handler, _dir) = handler();
        let response = call(
            &handler,
            "policy.reload",
            json!({"document": "version: 1\nnetwork_rules:\n  - name: bad\n    cidrs: [300.0.0.0/8]\n    decision: deny\n"}),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert!(error.message.contains("bad"));

        let response = call(&handler, "policy.version", Value::Null).await;
        assert_eq!(response.result.unwrap()["version"], 1);
    }

    #[tokio::test]
    async fn test_audit_query_by_session() {
        let (handler, _dir) = handler();
        call(&handler, "command.check", json!({"program": "ls", "session": "s9"})).await;
        call(&handler, "command.check", json!({"program": "sudo", "session": "s9"})).await;

        let response = call(&handler, "audit.query", json!({"session_id": "s9"})).await;
        assert_eq!(response.result.unwrap().as_array().unwrap().len(), 2);

        let response = call(&handler, "audit.stats", Value::Null).await;
        let stats = response.result.unwrap();
        assert_eq!(stats["denied"], 1);
    }
}
