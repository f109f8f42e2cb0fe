//! Command shims
//!
//! `warden-shim` is installed under several names (`bash`, `sh`, `rm`,
//! `curl`, ...) in a directory placed first on the agent's `PATH`. Each
//! invocation asks the gateway before anything runs:
//!
//! - shells: a `-c` line is analysed and every simple command checked; the
//!   real shell runs the line only when all of them are allowed
//! - `rm`: the invocation is checked, then each operand is moved to
//!   quarantine through the gateway instead of being unlinked
//! - anything else: checked as a command, then run from `PATH` with the
//!   shim directory skipped
//!
//! A blocked or unverifiable invocation exits 126 with the denial on stderr.

use crate::command::line::SHELLS;
use crate::rpc::{ClientError, RpcClient};
use dlp::{Redactor, StreamRedactor};
use serde_json::{json, Value};
use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};
use warden_core::{Paths, ServerConfig};

/// Exit status for blocked invocations, as a shell reports "cannot execute"
pub const DENIED_EXIT: i32 = 126;
/// Exit status when the real program cannot be found
pub const NOT_FOUND_EXIT: i32 = 127;

pub const SESSION_ENV: &str = "WARDEN_SESSION";
pub const ACTOR_ENV: &str = "WARDEN_ACTOR";
pub const PROXY_ENV: &str = "WARDEN_PROXY";

/// Name of the multi-call binary itself
pub const SHIM_BINARY: &str = "warden-shim";

/// What the shim was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// `sh -c '<line>' ...`
    ShellLine { shell: String, line: String, args: Vec<String> },
    /// A shell without `-c` (script file or interactive)
    Shell { shell: String, args: Vec<String> },
    Remove { args: Vec<String> },
    Program { program: String, args: Vec<String> },
}

impl Invocation {
    pub fn classify(name: &str, args: Vec<String>) -> Self {
        if SHELLS.contains(&name) {
            return match shell_line(&args) {
                Some(line) => Self::ShellLine {
                    shell: name.to_string(),
                    line,
                    args,
                },
                None => Self::Shell {
                    shell: name.to_string(),
                    args,
                },
            };
        }
        if name == "rm" {
            return Self::Remove { args };
        }
        Self::Program {
            program: name.to_string(),
            args,
        }
    }
}

/// The line following `-c` (or a short option cluster containing `c`)
fn shell_line(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" || !arg.starts_with('-') {
            return None;
        }
        if !arg.starts_with("--") && arg[1..].contains('c') {
            return iter.next().cloned();
        }
    }
    None
}

/// Basename of `argv[0]`
pub fn invoked_name(argv0: &str) -> String {
    Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.to_string())
}

/// Who the shim acts for
#[derive(Debug, Clone)]
pub struct Identity {
    pub session: String,
    pub actor: String,
    pub cwd: Option<PathBuf>,
}

impl Identity {
    pub fn from_env() -> Self {
        Self {
            session: std::env::var(SESSION_ENV).unwrap_or_default(),
            actor: std::env::var(ACTOR_ENV).unwrap_or_else(|_| "agent".to_string()),
            cwd: std::env::current_dir().ok(),
        }
    }

    fn params(&self, mut extra: Value) -> Value {
        if let Value::Object(ref mut map) = extra {
            map.insert("session".to_string(), json!(self.session));
            map.insert("actor".to_string(), json!(self.actor));
            if let Some(ref cwd) = self.cwd {
                map.insert("cwd".to_string(), json!(cwd));
            }
        }
        extra
    }
}

enum Gate {
    Allowed,
    Denied(String),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RmArgs {
    force: bool,
    recursive: bool,
    dirs: bool,
    verbose: bool,
    operands: Vec<String>,
}

fn parse_rm(args: &[String]) -> RmArgs {
    let mut parsed = RmArgs::default();
    let mut options_done = false;
    for arg in args {
        if options_done || arg == "-" || !arg.starts_with('-') {
            parsed.operands.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "--" => options_done = true,
            "--force" => parsed.force = true,
            "--recursive" => parsed.recursive = true,
            "--dir" => parsed.dirs = true,
            "--verbose" => parsed.verbose = true,
            long if long.starts_with("--") => {}
            short => {
                for flag in short[1..].chars() {
                    match flag {
                        'f' => parsed.force = true,
                        'r' | 'R' => parsed.recursive = true,
                        'd' => parsed.dirs = true,
                        'v' => parsed.verbose = true,
                        _ => {}
                    }
                }
            }
        }
    }
    parsed
}

/// `PATH` without the shim directory, so lookups find the real program
pub fn clean_path(path: &std::ffi::OsStr, shim_dir: &Path) -> OsString {
    let kept: Vec<PathBuf> = std::env::split_paths(path)
        .filter(|dir| dir != shim_dir && !dir.as_os_str().is_empty())
        .collect();
    std::env::join_paths(kept).unwrap_or_default()
}

/// Resolve a program name against a search path
pub fn find_program(name: &str, path: &std::ffi::OsStr) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    std::env::split_paths(path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Proxy URL carrying the session as credentials
pub fn proxy_url(base: &str, identity: &Identity) -> String {
    let (scheme, rest) = match base.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", base),
    };
    let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    if identity.session.is_empty() {
        return format!("{}://{}", scheme, rest);
    }
    format!(
        "{}://{}:{}@{}",
        scheme,
        userinfo_escape(&identity.session),
        userinfo_escape(&identity.actor),
        rest
    )
}

fn userinfo_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

pub struct Shim {
    client: RpcClient,
    identity: Identity,
    config: ServerConfig,
    redactor: Option<Arc<Redactor>>,
    search_path: OsString,
}

impl Shim {
    pub fn new(client: RpcClient, identity: Identity, config: ServerConfig) -> Self {
        let redactor = if config.dlp.redact_command_output {
            match Redactor::from_config(&config.dlp) {
                Ok(r) => Some(Arc::new(r)),
                Err(e) => {
                    warn!(error = %e, "invalid redaction config, using built-in patterns");
                    Some(Arc::new(Redactor::builtin()))
                }
            }
        } else {
            None
        };
        let path = std::env::var_os("PATH").unwrap_or_default();
        let search_path = clean_path(&path, &config.shim.shim_dir);
        Self {
            client,
            identity,
            config,
            redactor,
            search_path,
        }
    }

    /// Shim configured from the environment and the server config file
    pub fn from_env() -> anyhow::Result<Self> {
        let config = ServerConfig::load()?;
        let socket = config.socket_path(&Paths::new());
        Ok(Self::new(RpcClient::new(socket), Identity::from_env(), config))
    }

    /// Override the search path used to find real programs
    pub fn with_search_path(mut self, path: OsString) -> Self {
        self.search_path = path;
        self
    }

    /// Handle one invocation and return the process exit code
    pub async fn run(&self, invocation: Invocation) -> i32 {
        debug!(?invocation, "shim invoked");
        match invocation {
            Invocation::ShellLine { shell, line, args } => {
                match self.check("command.check_line", json!({ "line": line }), &shell).await {
                    Gate::Allowed => self.spawn_shell(&shell, &args, true).await,
                    Gate::Denied(signal) => deny(&signal),
                }
            }
            Invocation::Shell { shell, args } => {
                let params = json!({ "program": shell, "args": args });
                match self.check("command.check", params, &shell).await {
                    Gate::Allowed => self.spawn_shell(&shell, &args, false).await,
                    Gate::Denied(signal) => deny(&signal),
                }
            }
            Invocation::Remove { args } => {
                let params = json!({ "program": "rm", "args": args });
                match self.check("command.check", params, "rm").await {
                    Gate::Allowed => self.remove(&args).await,
                    Gate::Denied(signal) => deny(&signal),
                }
            }
            Invocation::Program { program, args } => {
                let params = json!({ "program": program, "args": args });
                match self.check("command.check", params, &program).await {
                    Gate::Allowed => match find_program(&program, &self.search_path) {
                        Some(path) => self.spawn(&path, &program, &args, true).await,
                        None => {
                            eprintln!("{}: command not found", program);
                            NOT_FOUND_EXIT
                        }
                    },
                    Gate::Denied(signal) => deny(&signal),
                }
            }
        }
    }

    async fn check(&self, method: &str, params: Value, program: &str) -> Gate {
        match self.client.call(method, self.identity.params(params)).await {
            Ok(result) if result["allowed"].as_bool() == Some(true) => Gate::Allowed,
            Ok(result) => Gate::Denied(
                result["signal"]
                    .as_str()
                    .unwrap_or("warden: blocked by policy")
                    .to_string(),
            ),
            Err(e) if e.is_denial() => Gate::Denied(e.to_string()),
            Err(e) => Gate::Denied(format!("warden: gateway unavailable, refusing to run {}: {}", program, e)),
        }
    }

    async fn spawn_shell(&self, shell: &str, args: &[String], redact: bool) -> i32 {
        let real = self.config.shim.real_shell.clone();
        if !is_executable(&real) {
            eprintln!("warden: real shell {} is not executable", real.display());
            return NOT_FOUND_EXIT;
        }
        self.spawn(&real, shell, args, redact).await
    }

    async fn spawn(&self, path: &Path, name: &str, args: &[String], redact: bool) -> i32 {
        let mut command = Command::new(path);
        command.arg0(name).args(args).stdin(Stdio::inherit());
        self.export_proxy(&mut command);

        let redactor = if redact { self.redactor.clone() } else { None };
        let result = match redactor {
            Some(redactor) => run_redacted(command, redactor).await,
            None => command
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await,
        };
        match result {
            Ok(status) => exit_code(status),
            Err(e) => {
                eprintln!("{}: {}", name, e);
                DENIED_EXIT
            }
        }
    }

    fn export_proxy(&self, command: &mut Command) {
        if !self.config.shim.export_proxy {
            return;
        }
        let base = std::env::var(PROXY_ENV).unwrap_or_else(|_| format!("http://{}", self.config.proxy.listen));
        let url = proxy_url(&base, &self.identity);
        for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            command.env(var, &url);
        }
    }

    async fn remove(&self, args: &[String]) -> i32 {
        let rm = parse_rm(args);
        if rm.operands.is_empty() {
            if rm.force {
                return 0;
            }
            eprintln!("rm: missing operand");
            return 1;
        }

        let mut code = 0;
        for operand in &rm.operands {
            let path = match self.identity.cwd {
                Some(ref cwd) => cwd.join(operand),
                None => PathBuf::from(operand),
            };
            let metadata = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) if rm.force => continue,
                Err(e) => {
                    eprintln!("rm: cannot remove '{}': {}", operand, e);
                    code = code.max(1);
                    continue;
                }
            };
            if metadata.is_dir() && !rm.recursive && !rm.dirs {
                eprintln!("rm: cannot remove '{}': Is a directory", operand);
                code = code.max(1);
                continue;
            }

            let params = self.identity.params(json!({ "path": path }));
            match self.client.call("fs.delete", params).await {
                Ok(_) => {
                    if rm.verbose {
                        println!("removed '{}'", operand);
                    }
                }
                Err(e) if e.is_denial() => {
                    eprintln!("{}", e);
                    code = DENIED_EXIT;
                }
                Err(e @ ClientError::Rpc { .. }) => {
                    eprintln!("rm: cannot remove '{}': {}", operand, e);
                    code = code.max(1);
                }
                Err(e) => {
                    eprintln!("warden: gateway unavailable, refusing to remove '{}': {}", operand, e);
                    code = DENIED_EXIT;
                }
            }
        }
        code
    }
}

fn deny(signal: &str) -> i32 {
    eprintln!("{}", signal);
    DENIED_EXIT
}

/// Run with stdout/stderr piped through the stream redactor
async fn run_redacted(mut command: Command, redactor: Arc<Redactor>) -> io::Result<ExitStatus> {
    let mut child = command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_task = stdout.map(|r| tokio::spawn(pump(r, tokio::io::stdout(), redactor.clone())));
    let err_task = stderr.map(|r| tokio::spawn(pump(r, tokio::io::stderr(), redactor)));

    let status = child.wait().await?;
    for task in [out_task, err_task].into_iter().flatten() {
        match task.await {
            Ok(Ok(redacted)) if redacted > 0 => debug!(redacted, "masked sensitive output"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "output relay ended early"),
            Err(e) => debug!(error = %e, "output relay task failed"),
        }
    }
    Ok(status)
}

async fn pump<R, W>(mut reader: R, mut writer: W, redactor: Arc<Redactor>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stream = StreamRedactor::new(redactor);
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let out = stream.push(&buf[..n]);
        if !out.is_empty() {
            writer.write_all(&out).await?;
            writer.flush().await?;
        }
    }
    let tail = stream.finish();
    writer.write_all(&tail).await?;
    writer.flush().await?;
    Ok(stream.redactions())
}
