//! Parsing of the `KEY=VALUE` release-description file.
//!
//! Quoting and comment lines are preserved verbatim: `get`/`to_map` return
//! values exactly as written, quotes included, and `format` round trips
//! byte-for-byte on lines this module does not itself need to interpret.

use std::collections::BTreeMap;

/// Keys the dependency evaluator and reporting layer read directly from the
/// release-description file.
pub const RELEASE_BOARD: &str = "CHROMEOS_RELEASE_BOARD";
pub const RELEASE_BUILDER_PATH: &str = "CHROMEOS_RELEASE_BUILDER_PATH";
pub const RELEASE_CHROME_MILESTONE: &str = "CHROMEOS_RELEASE_CHROME_MILESTONE";
pub const RELEASE_VERSION: &str = "CHROMEOS_RELEASE_VERSION";
pub const RELEASE_BUILD_TYPE: &str = "CHROMEOS_RELEASE_BUILD_TYPE";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// A `KEY=VALUE` pair, with the value kept exactly as written
    /// (including any surrounding quotes).
    KeyValue { key: String, raw_value: String },
    /// Anything else: comments, blank lines, malformed lines.
    Verbatim(String),
}

/// A parsed release-description document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseDescription {
    lines: Vec<Line>,
}

impl ReleaseDescription {
    /// Parses `content` into a document, preserving every line.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut lines = Vec::new();
        for raw_line in content.lines() {
            let trimmed = raw_line.trim_start();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                lines.push(Line::Verbatim(raw_line.to_owned()));
                continue;
            }
            match raw_line.split_once('=') {
                Some((key, value)) if is_valid_key(key) => lines.push(Line::KeyValue {
                    key: key.to_owned(),
                    raw_value: value.to_owned(),
                }),
                _ => lines.push(Line::Verbatim(raw_line.to_owned())),
            }
        }
        Self { lines }
    }

    /// Looks up `key`. Any surrounding quotes in the source line are
    /// returned as part of the value, not stripped.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::KeyValue { key: k, raw_value } if k == key => Some(raw_value.as_str()),
            _ => None,
        })
    }

    /// Returns all key-value pairs as a map, values exactly as written
    /// (quotes, if any, included).
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::KeyValue { key, raw_value } => Some((key.clone(), raw_value.clone())),
                Line::Verbatim(_) => None,
            })
            .collect()
    }

    /// Re-serializes the document, byte-identical to the input this was
    /// parsed from (modulo a trailing newline if the input lacked one).
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::KeyValue { key, raw_value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(raw_value);
                }
                Line::Verbatim(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit())
}
