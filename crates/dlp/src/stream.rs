//! Line-oriented redaction for output streams
//!
//! Command output arrives in arbitrary chunks. The stream redactor buffers
//! up to a newline, masks whole lines, and swallows PEM private-key blocks
//! that span several lines.

use crate::pattern::placeholder;
use crate::redactor::Redactor;
use std::borrow::Cow;
use std::sync::Arc;

/// Lines longer than this are flushed without waiting for a newline
pub const MAX_LINE: usize = 64 * 1024;

/// Bytes held back when a long line is flushed early
pub const OVERLAP: usize = 4 * 1024;

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_END: &str = "-----END ";
const PEM_MARK: &str = "PRIVATE KEY";

pub struct StreamRedactor {
    redactor: Arc<Redactor>,
    pending: Vec<u8>,
    in_private_key: bool,
    redactions: usize,
}

impl StreamRedactor {
    pub fn new(redactor: Arc<Redactor>) -> Self {
        Self {
            redactor,
            pending: Vec::new(),
            in_private_key: false,
            redactions: 0,
        }
    }

    /// Number of spans masked so far
    pub fn redactions(&self) -> usize {
        self.redactions
    }

    /// Feed a chunk; returns the bytes that are safe to emit now
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        if !self.redactor.is_enabled() {
            return chunk.to_vec();
        }

        self.pending.extend_from_slice(chunk);
        let mut out = Vec::with_capacity(chunk.len());

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit_line(&line, &mut out);
        }

        if self.pending.len() > MAX_LINE {
            let cut = self.flush_point();
            let head: Vec<u8> = self.pending.drain(..cut).collect();
            self.emit_line(&head, &mut out);
        }
        out
    }

    /// Where to split an over-long line: `OVERLAP` bytes from the end,
    /// moved back to the start of any match that would straddle the split
    fn flush_point(&self) -> usize {
        let len = self.pending.len();
        let mut cut = len - OVERLAP;
        if let Ok(text) = std::str::from_utf8(&self.pending) {
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            if let Some(finding) = self
                .redactor
                .scan(text)
                .into_iter()
                .find(|f| f.start < cut && f.end > cut)
            {
                cut = finding.start;
            }
        }
        if cut == 0 {
            len
        } else {
            cut
        }
    }

    /// Flush whatever is buffered at end of stream
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit_line(&line, &mut out);
        }
        self.in_private_key = false;
        out
    }

    fn emit_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        let text = String::from_utf8_lossy(line);

        if self.in_private_key {
            if text.contains(PEM_END) && text.contains(PEM_MARK) {
                self.in_private_key = false;
                if line.ends_with(b"\n") {
                    out.push(b'\n');
                }
            }
            return;
        }

        if text.contains(PEM_BEGIN) && text.contains(PEM_MARK) && !text.contains(PEM_END) {
            self.in_private_key = true;
            self.redactions += 1;
            let before = text.find(PEM_BEGIN).unwrap_or(0);
            out.extend_from_slice(self.mask(&text[..before]).as_bytes());
            out.extend_from_slice(placeholder("private_key").as_bytes());
            return;
        }

        let redaction = self.redactor.redact(&text);
        if redaction.is_clean() {
            // Untouched bytes, even when they are not valid UTF-8
            out.extend_from_slice(line);
        } else {
            self.redactions += redaction.findings.len();
            out.extend_from_slice(redaction.text.as_bytes());
        }
    }

    fn mask<'a>(&mut self, text: &'a str) -> Cow<'a, str> {
        let redaction = self.redactor.redact(text);
        self.redactions += redaction.findings.len();
        redaction.text
    }
}
