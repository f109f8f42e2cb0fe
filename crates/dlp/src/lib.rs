//! Warden DLP - output redaction
//!
//! Masks credentials, keys and personal data in text on its way to an agent
//! (command output, proxied response bodies). Each match is replaced with a
//! fixed `[REDACTED:<pattern>]` placeholder that carries nothing of the
//! original value.
//!
//! Matching is bounded by the length of the input: no I/O, no callbacks.
//! Over-masking is preferred to leaking, so overlapping matches are merged
//! and masked as one span.

pub mod pattern;
pub mod redactor;
pub mod stream;

pub use pattern::{builtin_patterns, RedactionPattern};
pub use redactor::{DlpError, Finding, Redaction, Redactor};
pub use stream::StreamRedactor;
