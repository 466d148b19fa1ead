//! Process output classification.
//!
//! Install and dev-server processes print whatever their tools print:
//! npm progress, Vite banners, stack traces, ANSI colour codes. This module
//! turns that into tagged [`TerminalLine`]s using a small ordered rule table
//! ([`RULES`]). It is a heuristic, not a parser; unknown formats fall
//! through to [`LineKind::Muted`].

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Display category of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Command,
    Info,
    Success,
    Error,
    Output,
    Muted,
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalLine {
    pub text: String,
    pub kind: LineKind,
}

impl TerminalLine {
    pub fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn command(text: impl Into<String>) -> Self {
        Self::new(LineKind::Command, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LineKind::Info, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(LineKind::Success, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LineKind::Error, text)
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self::new(LineKind::Output, text)
    }
}

/// Pattern → classification. Markers match case-insensitively as
/// substrings; the first rule with a matching marker wins.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub kind: LineKind,
    pub markers: &'static [&'static str],
}

pub const RULES: &[ClassificationRule] = &[
    ClassificationRule {
        kind: LineKind::Success,
        markers: &["added ", "up to date", "packages in", "ready in", "compiled successfully", "done in"],
    },
    ClassificationRule {
        kind: LineKind::Muted,
        markers: &["warn", "deprecated"],
    },
    ClassificationRule {
        kind: LineKind::Error,
        markers: &["error", "err!", "failed", "cannot find", "exception"],
    },
    ClassificationRule {
        kind: LineKind::Info,
        markers: &["packages", "fetch", "resolving", "downloading", "progress", "audited", "installing"],
    },
];

/// Kind for lines that match no rule.
pub const FALLBACK: LineKind = LineKind::Muted;

fn matchers() -> &'static [(LineKind, AhoCorasick)] {
    static MATCHERS: OnceLock<Vec<(LineKind, AhoCorasick)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|rule| {
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(rule.markers)
                    .map_err(|e| tracing::warn!("Skipping output rule {:?}: {e}", rule.kind))
                    .ok()
                    .map(|ac| (rule.kind, ac))
            })
            .collect()
    })
}

/// Classify already-cleaned text by the rule table.
pub fn classify_kind(text: &str) -> LineKind {
    matchers()
        .iter()
        .find(|(_, ac)| ac.is_match(text))
        .map(|(kind, _)| *kind)
        .unwrap_or(FALLBACK)
}

/// Classify a single raw line of process output.
pub fn classify(raw_line: &str) -> TerminalLine {
    let text = clean(raw_line);
    let kind = classify_kind(&text);
    TerminalLine { text, kind }
}

/// Strip ANSI escapes and surrounding whitespace.
pub fn clean(raw: &str) -> String {
    strip_ansi_escapes::strip_str(raw).trim().to_string()
}

/// Reassembles lines from arbitrarily chunked process output.
///
/// Both `\n` and `\r` end a line (npm redraws progress with bare `\r`).
/// Lines that are empty after cleaning are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the lines it completed, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find(&['\n', '\r'][..]) {
            let line: String = self.pending.drain(..=idx).collect();
            let cleaned = clean(&line);
            if !cleaned.is_empty() {
                lines.push(cleaned);
            }
        }
        lines
    }

    /// Flush the trailing partial line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = clean(&std::mem::take(&mut self.pending));
        (!rest.is_empty()).then_some(rest)
    }
}

/// Decodes a byte stream as UTF-8 without splitting characters that
/// straddle read boundaries.
///
/// An incomplete trailing sequence is held back until the next read.
/// Bytes that can never form a character become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns all text that is complete so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let (valid, rest) = self.pending.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Truncated sequence at the end: wait for more bytes.
                        None => {
                            self.pending = rest.to_vec();
                            return text;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending = rest[len..].to_vec();
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back once the stream has ended.
    pub fn finish(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npm_install_lines() {
        assert_eq!(classify("added 312 packages in 9s").kind, LineKind::Success);
        assert_eq!(classify("up to date, audited 40 packages in 1s").kind, LineKind::Success);
        assert_eq!(
            classify("npm WARN deprecated inflight@1.0.6: not supported").kind,
            LineKind::Muted
        );
        assert_eq!(classify("npm ERR! code ERESOLVE").kind, LineKind::Error);
        assert_eq!(classify("audited 120 packages").kind, LineKind::Info);
    }

    #[test]
    fn vite_lines() {
        assert_eq!(classify("  VITE v5.0.8  ready in 312 ms").kind, LineKind::Success);
        assert_eq!(
            classify("[vite] Internal server error: Failed to resolve import").kind,
            LineKind::Error
        );
        assert_eq!(classify("  ➜  Local:   http://localhost:3000/").kind, LineKind::Muted);
    }

    #[test]
    fn rule_order_is_significant() {
        // success beats info even though "packages" also matches info
        assert_eq!(classify_kind("added 1 package, and audited 2 packages in 3s"), LineKind::Success);
        // warnings mentioning errors stay muted
        assert_eq!(classify_kind("warning: error-prone pattern"), LineKind::Muted);
    }

    #[test]
    fn every_rule_marker_classifies_to_its_rule() {
        for (i, rule) in RULES.iter().enumerate() {
            for marker in rule.markers {
                let earlier = RULES[..i]
                    .iter()
                    .any(|r| r.markers.iter().any(|m| marker.contains(m.trim())));
                if !earlier {
                    assert_eq!(classify_kind(marker), rule.kind, "marker {marker:?}");
                }
            }
        }
    }

    #[test]
    fn unknown_and_odd_input_is_tolerated() {
        assert_eq!(classify("").kind, FALLBACK);
        assert_eq!(classify("¯\\_(ツ)_/¯").kind, FALLBACK);
        assert_eq!(classify("\u{1b}[31mError\u{1b}[0m: boom").text, "Error: boom");
        assert_eq!(classify("\u{1b}[31mError\u{1b}[0m: boom").kind, LineKind::Error);
    }

    #[test]
    fn splitter_handles_chunk_boundaries_and_carriage_returns() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push("added 1 pa").is_empty());
        assert_eq!(splitter.push("ckage\n\nnext"), vec!["added 1 package"]);
        assert_eq!(splitter.push("\r\\ progress\r\n"), vec!["next", "\\ progress"]);
        assert_eq!(splitter.push("tail"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn decoder_keeps_characters_split_across_reads() {
        let mut bytes = vec![b'a'; 4095];
        bytes.extend_from_slice("➜ Local\n".as_bytes());
        let (first, second) = bytes.split_at(4096);

        let mut decoder = Utf8Decoder::new();
        let mut text = decoder.push(first);
        assert_eq!(text.len(), 4095);
        text.push_str(&decoder.push(second));
        text.push_str(&decoder.finish());

        assert!(text.ends_with("➜ Local\n"));
        assert!(!text.contains(char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"ok \xff done"), "ok \u{FFFD} done");
        assert_eq!(decoder.push(&"➜".as_bytes()[..2]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn terminal_line_serializes_lowercase_kind() {
        let json = serde_json::to_value(TerminalLine::command("$ npm install")).unwrap();
        assert_eq!(json["kind"], "command");
    }
}
