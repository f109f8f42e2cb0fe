//! Redaction patterns
//!
//! A pattern is a regex plus the placeholder that replaces its matches. When
//! the regex has a capture group named `secret`, only that group is masked
//! (so `password=hunter22` keeps `password=`).

use regex::Regex;

/// A named sensitive-content pattern
#[derive(Debug, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: Regex,
    pub replacement: String,
    /// Extra check on a candidate match (e.g. Luhn for card numbers)
    validator: Option<fn(&str) -> bool>,
}

impl RedactionPattern {
    /// Build a pattern; the replacement defaults to `[REDACTED:<name>]`
    pub fn new(name: &str, pattern: &str, replacement: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            regex: Regex::new(pattern)?,
            replacement: replacement
                .map(|r| r.to_string())
                .unwrap_or_else(|| placeholder(name)),
            validator: None,
        })
    }

    fn validated(mut self, check: fn(&str) -> bool) -> Self {
        self.validator = Some(check);
        self
    }

    /// Byte spans to mask in `text`
    pub fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let secret_group = self.regex.capture_names().any(|n| n == Some("secret"));
        let mut spans = Vec::new();

        if secret_group {
            for caps in self.regex.captures_iter(text) {
                let Some(m) = caps.name("secret").or_else(|| caps.get(0)) else {
                    continue;
                };
                if self.accepts(m.as_str()) {
                    spans.push((m.start(), m.end()));
                }
            }
        } else {
            for m in self.regex.find_iter(text) {
                if self.accepts(m.as_str()) {
                    spans.push((m.start(), m.end()));
                }
            }
        }
        spans
    }

    fn accepts(&self, candidate: &str) -> bool {
        !candidate.is_empty() && self.validator.map(|check| check(candidate)).unwrap_or(true)
    }
}

/// Placeholder written in place of a match
pub fn placeholder(name: &str) -> String {
    format!("[REDACTED:{}]", name)
}

/// Built-in patterns, most specific first. The first pattern covering a
/// span names its placeholder.
const BUILTIN: &[(&str, &str)] = &[
    (
        "private_key",
        r"(?s)-----BEGIN [A-Z0-9 ]*PRIVATE KEY( BLOCK)?-----.*?(-----END [A-Z0-9 ]*PRIVATE KEY( BLOCK)?-----|\z)",
    ),
    ("aws_access_key", r"\b(?:AKIA|ASIA|AGPA|AIDA|AROA)[0-9A-Z]{16}\b"),
    (
        "aws_secret_key",
        r#"(?i)aws_?secret_?(?:access_?)?key\s*[:=]\s*["']?(?P<secret>[A-Za-z0-9/+=]{40})"#,
    ),
    ("github_token", r"\b(?:gh[pousr]_[A-Za-z0-9]{36,255}|github_pat_[A-Za-z0-9_]{22,255})\b"),
    ("anthropic_key", r"\bsk-ant-[A-Za-z0-9_\-]{20,}"),
    ("openai_key", r"\bsk-(?:proj-|svcacct-)?[A-Za-z0-9_\-]{20,}"),
    ("stripe_key", r"\b(?:sk|rk|pk)_(?:live|test)_[A-Za-z0-9]{16,}"),
    ("slack_token", r"\bxox[abposr]-[A-Za-z0-9-]{10,}"),
    ("google_api_key", r"\bAIza[0-9A-Za-z_\-]{35}"),
    ("jwt", r"\beyJ[A-Za-z0-9_-]{8,}\.eyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}"),
    ("bearer_token", r"(?i)\bbearer\s+(?P<secret>[A-Za-z0-9._~+/\-]{16,}=*)"),
    (
        "url_credentials",
        r"(?i)\b[a-z][a-z0-9+.\-]*://[^\s:/@]+:(?P<secret>[^\s@/]+)@",
    ),
    (
        "secret_assignment",
        r#"(?i)(?:\b|[_-])(?:api[_-]?key|access[_-]?token|auth[_-]?token|client[_-]?secret|secret[_-]?key|secret|password|passwd|token)\b["']?\s*[:=]\s*["']?(?P<secret>[^\s"',;]{8,})"#,
    ),
    ("email", r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b"),
    ("us_ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("credit_card", r"\b\d(?:[ \-]?\d){12,18}\b"),
];

/// The built-in pattern set
pub fn builtin_patterns() -> Vec<RedactionPattern> {
    BUILTIN
        .iter()
        .filter_map(|(name, pattern)| match RedactionPattern::new(name, pattern, None) {
            Ok(p) if *name == "credit_card" => Some(p.validated(luhn_valid)),
            Ok(p) => Some(p),
            Err(e) => {
                tracing::error!(pattern = name, error = %e, "built-in redaction pattern failed to compile");
                None
            }
        })
        .collect()
}

/// Luhn checksum over the digits of a candidate card number
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
