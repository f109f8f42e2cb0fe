//! warden - policy-enforced execution gateway for sandboxed coding agents
//!
//! "Let the agent work. Decide every side effect."
//!
//! `warden serve` runs the gateway. Every other command is either offline
//! (policy checks, evaluation, audit queries against the store) or talks to
//! the running gateway over its RPC socket.

use anyhow::{bail, Context, Result};
use audit::{AuditEvent, AuditQuery, AuditStats, AuditStore, Outcome};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use policy::{Action, Decision, FileOp, OperationDescriptor, OperationKind, RuleSet, Target, Transport};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use warden::fsguard::{normalize, Floor};
use warden::rpc::RpcClient;
use warden_core::format::{parse_since, relative_time, truncate};
use warden_core::{Paths, ServerConfig};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Policy-enforced execution gateway for sandboxed coding agents")]
#[command(version)]
#[command(after_help = "\
Warden sits between an agent and its sandbox. Commands, outbound connections
and file operations are decided against a declarative policy, held for a human
when the policy says so, audited, and only then allowed to happen.

COMMANDS:
    serve         Run the gateway (proxy, shim socket, control surface)
    init          Write a default config and policy
    check         Validate a policy document
    eval          Evaluate one operation against a policy, offline
    audit         Query the audit log
    approvals     List approval requests
    approve/deny  Resolve an approval request
    quarantine    Inspect, restore or purge soft-deleted files
    reload        Reload the policy file in the running gateway
    status        Show gateway status
    end-session   Cancel a session's pending approvals

EXAMPLES:
    warden init                           # Default config and policy
    warden check policy.yaml              # Validate before deploying
    warden eval command rm -rf /tmp/x     # What would happen?
    warden eval net 169.254.169.254 80
    warden audit --session s1 --since 1h  # Recent activity of one session
    warden approvals                      # Pending approvals
    warden approve 3f2c... --note 'ok'")]
struct Cli {
    /// Server config file
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve,

    /// Write the default config and policy
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Validate a policy document
    Check {
        /// Policy file
        policy: PathBuf,
    },

    /// Evaluate an operation against a policy without running it
    Eval {
        /// Policy file (defaults to the configured policy)
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(subcommand)]
        target: EvalTarget,
    },

    /// Query the audit log
    Audit {
        #[arg(long)]
        session: Option<String>,

        /// Window like 30m, 2h, 7d, or an RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        until: Option<String>,

        /// command, network, file or control
        #[arg(long)]
        kind: Option<String>,

        /// allowed or denied
        #[arg(long)]
        outcome: Option<String>,

        #[arg(long)]
        rule: Option<String>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Show totals instead of events
        #[arg(long)]
        stats: bool,
    },

    /// List approval requests
    Approvals {
        /// Include resolved requests
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Grant an approval request
    Approve {
        id: String,

        #[arg(long)]
        note: Option<String>,

        /// Approver name recorded in the audit log
        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Deny an approval request
    Deny {
        id: String,

        #[arg(long)]
        note: Option<String>,

        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Inspect, restore or purge quarantined files
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Reload the policy file in the running gateway
    Reload,

    /// Show gateway status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// End a session, expiring its pending approvals
    EndSession { session: String },
}

#[derive(Subcommand)]
enum EvalTarget {
    /// A program invocation
    Command {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// An outbound connection
    Net {
        host: String,
        port: u16,
        /// http, https, tcp or udp
        #[arg(long, default_value = "tcp")]
        transport: String,
    },
    /// A file operation
    File {
        path: PathBuf,
        /// read, write or delete
        #[arg(default_value = "read")]
        operation: String,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List quarantined files
    List {
        #[arg(long)]
        session: Option<String>,
        /// Only entries for this original path
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Move an entry back to its original path
    Restore {
        id: String,
        /// Replace a file that now exists at the original path
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete entries older than a given age
    Purge {
        /// Age like 7d or 12h (defaults to the configured age)
        #[arg(long)]
        older_than: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths::new();
    let config = match cli.config {
        Some(ref path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load()?,
    };

    match cli.command {
        Commands::Serve => warden::daemon::serve(config, paths).await,
        Commands::Init { force } => cmd_init(&paths, cli.config.as_deref(), force),
        Commands::Check { policy } => cmd_check(&policy),
        Commands::Eval { policy, json, target } => cmd_eval(&config, &paths, policy.as_deref(), target, json),
        Commands::Audit {
            session,
            since,
            until,
            kind,
            outcome,
            rule,
            limit,
            json,
            stats,
        } => {
            let query = build_query(session, since, until, kind, outcome, rule, limit)?;
            cmd_audit(&config, &paths, query, json, stats).await
        }
        Commands::Approvals { all, json } => cmd_approvals(&client(&config, &paths), all, json).await,
        Commands::Approve { id, note, by } => cmd_resolve(&client(&config, &paths), &id, "grant", &by, note).await,
        Commands::Deny { id, note, by } => cmd_resolve(&client(&config, &paths), &id, "deny", &by, note).await,
        Commands::Quarantine { action } => cmd_quarantine(&client(&config, &paths), action).await,
        Commands::Reload => cmd_reload(&client(&config, &paths)).await,
        Commands::Status { json } => cmd_status(&client(&config, &paths), json).await,
        Commands::EndSession { session } => cmd_end_session(&client(&config, &paths), &session).await,
    }
}

/// Operator commands go to the owner-only socket; status also works on the
/// agent socket when the operator socket is disabled
fn client(config: &ServerConfig, paths: &Paths) -> RpcClient {
    RpcClient::new(
        config
            .operator_socket_path(paths)
            .unwrap_or_else(|| config.socket_path(paths)),
    )
}

/// Write the default config and policy
fn cmd_init(paths: &Paths, config_path: Option<&Path>, force: bool) -> Result<()> {
    let config_file = config_path.map(Path::to_path_buf).unwrap_or_else(|| paths.config_file());
    let config = ServerConfig::default();
    let policy_file = config.policy_path(paths);

    for file in [&config_file, &policy_file] {
        if file.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", file.display());
        }
    }

    config.save_to(&config_file)?;
    if let Some(parent) = policy_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&policy_file, policy::DEFAULT_POLICY)
        .with_context(|| format!("Failed to write policy to {:?}", policy_file))?;

    println!("Wrote {}", config_file.display());
    println!("Wrote {}", policy_file.display());
    Ok(())
}

fn load_policy(path: &Path) -> Result<RuleSet> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read policy from {:?}", path))?;
    Ok(policy::document::load_with_source(&raw, Some(path))?)
}

/// Validate a policy document
fn cmd_check(path: &Path) -> Result<()> {
    let set = load_policy(path)?;
    println!("{}: ok", path.display());
    for kind in [OperationKind::Command, OperationKind::Network, OperationKind::File] {
        println!(
            "  {:8} {:3} rules, default {}",
            kind.as_str(),
            set.rules_for(kind).len(),
            set.defaults.for_kind(kind)
        );
    }
    println!("  protected files default {}", set.defaults.protected_file);
    println!("  digest {}", set.short_digest());
    Ok(())
}

/// Evaluate one operation offline
fn cmd_eval(
    config: &ServerConfig,
    paths: &Paths,
    policy_path: Option<&Path>,
    target: EvalTarget,
    json: bool,
) -> Result<()> {
    let set = match policy_path {
        Some(path) => load_policy(path)?,
        None => {
            let path = config.policy_path(paths);
            if path.exists() {
                load_policy(&path)?
            } else {
                policy::load(policy::DEFAULT_POLICY)?
            }
        }
    };

    let cwd = std::env::current_dir().ok();
    let operation = match target {
        EvalTarget::Command { program, args } => OperationDescriptor::new(
            "cli",
            "cli",
            Target::Command {
                program,
                args,
                cwd: cwd.clone(),
            },
        ),
        EvalTarget::Net { host, port, transport } => {
            let transport = parse_transport(&transport)?;
            let addrs = resolve(&host, port);
            OperationDescriptor::new("cli", "cli", Target::network(host, port, transport)).with_addrs(addrs)
        }
        EvalTarget::File { path, operation } => {
            let op = FileOp::from_str(&operation).with_context(|| format!("Unknown file operation: {}", operation))?;
            OperationDescriptor::new("cli", "cli", Target::file(normalize(&path, cwd.as_deref()), op))
        }
    };

    let decision = match operation.target {
        Target::File { ref path, operation: op } => Floor::builtin()
            .check(path, op, set.version)
            .unwrap_or_else(|| policy::evaluate(&operation, &set)),
        _ => policy::evaluate(&operation, &set),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&json!({ "operation": operation, "decision": decision }))?);
    } else {
        print_decision(&operation, &decision);
    }
    Ok(())
}

fn print_decision(operation: &OperationDescriptor, decision: &Decision) {
    let source = match decision.matched_rule {
        Some(ref rule) => format!("rule '{}'", rule),
        None => decision.reason.as_str().to_string(),
    };
    println!("{}", operation.target.summary());
    println!("  {} ({})", decision.action, source);
    if !decision.message.is_empty() {
        println!("  {}", decision.message);
    }
    if decision.action == Action::Approve {
        if let Some(timeout) = decision.timeout {
            println!("  approval timeout {}", humantime::format_duration(timeout));
        }
        println!("  on timeout: {}", decision.on_timeout.as_str());
    }
}

fn parse_transport(s: &str) -> Result<Transport> {
    Ok(match s.to_lowercase().as_str() {
        "http" => Transport::Http,
        "https" => Transport::Https,
        "tcp" => Transport::Tcp,
        "udp" => Transport::Udp,
        other => bail!("Unknown transport: {}", other),
    })
}

fn resolve(host: &str, port: u16) -> Vec<std::net::IpAddr> {
    use std::net::ToSocketAddrs;
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse() {
        return vec![ip];
    }
    (host, port)
        .to_socket_addrs()
        .map(|addrs| addrs.map(|a| a.ip()).collect())
        .unwrap_or_default()
}

/// Relative window (`2h`) or an absolute RFC 3339 timestamp
fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    parse_since(s)
}

fn build_query(
    session: Option<String>,
    since: Option<String>,
    until: Option<String>,
    kind: Option<String>,
    outcome: Option<String>,
    rule: Option<String>,
    limit: usize,
) -> Result<AuditQuery> {
    let mut query = AuditQuery::default().limit(limit);
    if let Some(ref session) = session {
        query = query.session(session);
    }
    if let Some(ref since) = since {
        query = query.since(parse_time(since)?);
    }
    if let Some(ref until) = until {
        query = query.until(parse_time(until)?);
    }
    if let Some(ref kind) = kind {
        query = query.kind(OperationKind::from_str(kind).with_context(|| format!("Unknown kind: {}", kind))?);
    }
    if let Some(ref outcome) = outcome {
        query = query.outcome(Outcome::from_str(outcome).with_context(|| format!("Unknown outcome: {}", outcome))?);
    }
    if let Some(ref rule) = rule {
        query = query.rule(rule);
    }
    Ok(query)
}

/// Audit queries read the store directly so they work with the gateway down
async fn cmd_audit(config: &ServerConfig, paths: &Paths, query: AuditQuery, json: bool, stats: bool) -> Result<()> {
    let path = config.audit_path(paths);
    if !path.exists() {
        bail!("No audit log at {}", path.display());
    }
    let store = AuditStore::open(&path).with_context(|| format!("Failed to open audit store at {:?}", path))?;

    if stats {
        let stats = store.stats(query.since)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            print_stats(&stats);
        }
        return Ok(());
    }

    let events = store.query(&query)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    if events.is_empty() {
        println!("No matching events.");
        return Ok(());
    }
    for event in &events {
        print_event(event);
    }
    Ok(())
}

fn print_event(event: &AuditEvent) {
    let rule = event.decision.matched_rule.as_deref().unwrap_or(event.decision.reason.as_str());
    println!(
        "{:>8}  {:8} {:7} {:8} {:20} {}",
        relative_time(event.recorded_at),
        event.operation.session_id,
        event.outcome.as_str(),
        event.operation.kind().as_str(),
        truncate(rule, 20),
        truncate(&event.operation.target.summary(), 60)
    );
}

fn print_stats(stats: &AuditStats) {
    println!("Audit Statistics");
    println!("================");
    println!();
    println!("Total:     {}", stats.total);
    println!("Allowed:   {}", stats.allowed);
    println!("Denied:    {} ({:.1}%)", stats.denied, stats.deny_rate());
    println!();
    println!("Decisions: allow {} / deny {} / approve {}", stats.action_allow, stats.action_deny, stats.action_approve);
    println!(
        "Approvals: granted {} / denied {} / expired {}",
        stats.approvals_granted, stats.approvals_denied, stats.approvals_expired
    );
}

async fn cmd_approvals(client: &RpcClient, all: bool, json: bool) -> Result<()> {
    let list = client.call("approval.list", json!({ "all": all })).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }
    let requests = list.as_array().cloned().unwrap_or_default();
    if requests.is_empty() {
        println!("No {}approval requests.", if all { "" } else { "pending " });
        return Ok(());
    }
    for request in &requests {
        let target: Option<Target> = serde_json::from_value(request["operation"]["target"].clone()).ok();
        println!(
            "{}  {:8} {:8} {:20} {}",
            str_field(request, "id"),
            str_field(request, "state"),
            request["operation"]["session_id"].as_str().unwrap_or("?"),
            request["rule"].as_str().unwrap_or("default"),
            target.map(|t| t.summary()).unwrap_or_default()
        );
    }
    Ok(())
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("?")
}

async fn cmd_resolve(client: &RpcClient, id: &str, decision: &str, by: &str, note: Option<String>) -> Result<()> {
    let request = client
        .call(
            "approval.resolve",
            json!({ "id": id, "decision": decision, "approver": by, "note": note }),
        )
        .await?;
    println!("{} {}", str_field(&request, "id"), str_field(&request, "state"));
    Ok(())
}

async fn cmd_quarantine(client: &RpcClient, action: QuarantineAction) -> Result<()> {
    match action {
        QuarantineAction::List { session, path, json } => {
            let entries = client
                .call("quarantine.list", json!({ "session": session, "path": path }))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            let entries = entries.as_array().cloned().unwrap_or_default();
            if entries.is_empty() {
                println!("Quarantine is empty.");
            }
            for entry in &entries {
                println!(
                    "{}  {:8} {}",
                    str_field(entry, "id"),
                    str_field(entry, "deleted_by_session"),
                    str_field(entry, "original_path")
                );
            }
        }
        QuarantineAction::Restore { id, overwrite } => {
            let entry = client
                .call("quarantine.restore", json!({ "id": id, "overwrite": overwrite }))
                .await?;
            println!("Restored {}", str_field(&entry, "original_path"));
        }
        QuarantineAction::Purge { older_than } => {
            let purged = client
                .call("quarantine.purge", json!({ "older_than": older_than }))
                .await?;
            println!("Purged {} entries", purged.as_array().map(|a| a.len()).unwrap_or(0));
        }
    }
    Ok(())
}

async fn cmd_reload(client: &RpcClient) -> Result<()> {
    let result = client.call("policy.reload", json!({})).await?;
    match result["outcome"].as_str() {
        Some("updated") => println!("Policy updated to version {}", result["version"]),
        _ => println!("Policy unchanged (version {})", result["version"]),
    }
    Ok(())
}

async fn cmd_status(client: &RpcClient, json: bool) -> Result<()> {
    let status = match client.call("status", Value::Null).await {
        Ok(status) => status,
        Err(e) => {
            if json {
                println!("{}", json!({ "running": false, "error": e.to_string() }));
            } else {
                println!("Gateway: not running ({})", e);
            }
            return Ok(());
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Warden Status");
    println!("=============");
    println!();
    println!("Gateway:   running (v{})", status["version"].as_str().unwrap_or("?"));
    println!(
        "Policy:    version {} ({} rules, {})",
        status["policy_version"], status["rules"], status["policy_digest"].as_str().unwrap_or("?")
    );
    let backends: Vec<&str> = status["backends"]
        .as_array()
        .map(|a| a.iter().filter_map(|b| b.as_str()).collect())
        .unwrap_or_default();
    println!("Backends:  {}", if backends.is_empty() { "none".to_string() } else { backends.join(", ") });
    println!("Sessions:  {}", status["sessions"]);
    println!("Approvals: {} pending", status["approvals_pending"]);
    if status["audit_degraded"].as_bool() == Some(true) {
        println!("Audit:     DEGRADED ({} failed writes, spilling)", status["audit_write_failures"]);
    } else {
        println!("Audit:     ok");
    }
    Ok(())
}

async fn cmd_end_session(client: &RpcClient, session: &str) -> Result<()> {
    let result = client.call("session.end", json!({ "session": session })).await?;
    let expired = result["expired"].as_array().map(|a| a.len()).unwrap_or(0);
    println!("Session {} ended, {} pending approvals expired", session, expired);
    Ok(())
}
