//! Command interception
//!
//! The shim and RPC callers hand over either one program invocation or a
//! whole shell line. A line is broken into its simple commands and each is
//! decided on its own; the line runs only when every command is allowed.

mod exec;
pub mod line;

pub use exec::{ExecError, ExecOutput};
pub use line::{analyze, expand, LineError, SimpleCommand};

use crate::engine::{Caller, Engine, Verdict};
use policy::Target;
use serde::Serialize;
use tracing::debug;

/// Outcome of checking a shell line
#[derive(Debug, Clone, Serialize)]
pub struct LineVerdict {
    pub allowed: bool,
    /// One verdict per command checked, in line order. Checking stops at the
    /// first denial.
    pub commands: Vec<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl LineVerdict {
    pub fn denied(&self) -> Option<&Verdict> {
        self.commands.iter().find(|v| !v.allowed())
    }
}

fn command_target(caller: &Caller, program: &str, args: &[String]) -> Target {
    Target::Command {
        program: program.to_string(),
        args: args.to_vec(),
        cwd: caller.cwd.clone(),
    }
}

impl Engine {
    /// Decide and audit one program invocation
    pub async fn check_command(&self, caller: &Caller, program: &str, args: &[String]) -> Verdict {
        self.authorize(caller.descriptor(command_target(caller, program, args))).await
    }

    /// Decide every command a shell line would run
    pub async fn check_line(&self, caller: &Caller, line: &str) -> LineVerdict {
        let commands = match analyze(line) {
            Ok(commands) => commands,
            Err(e) => {
                debug!(session = %caller.session, error = %e, "unparseable command line");
                let op = caller.descriptor(command_target(caller, "sh", &["-c".to_string(), line.to_string()]));
                let verdict = self.deny(op, &format!("command line cannot be analysed: {}", e)).await;
                return LineVerdict {
                    allowed: false,
                    signal: Some(verdict.signal()),
                    commands: vec![verdict],
                };
            }
        };

        let mut verdicts = Vec::with_capacity(commands.len());
        for command in commands {
            let verdict = self.check_command(caller, &command.program, &command.args).await;
            let allowed = verdict.allowed();
            verdicts.push(verdict);
            if !allowed {
                break;
            }
        }

        let signal = verdicts.iter().find(|v| !v.allowed()).map(|v| v.signal());
        LineVerdict {
            allowed: signal.is_none(),
            commands: verdicts,
            signal,
        }
    }
}
