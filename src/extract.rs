//! Best-effort JSON extraction from free-form model output.
//!
//! Models wrap JSON in prose, markdown fences, or both. Parsing tries an
//! ordered list of strategies and the first one that deserializes wins:
//! - the whole (trimmed) response
//! - the body of the first fenced code block
//! - the first balanced `{...}` / `[...]` substring, then the widest span
//!   between the first opening and last closing delimiter

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("fenced block regex")
});

/// One step of the parse cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Strict,
    FencedBlock,
    BraceScan,
}

impl Strategy {
    /// Cascade order.
    pub const ALL: [Strategy; 3] = [Strategy::Strict, Strategy::FencedBlock, Strategy::BraceScan];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Strict => "strict",
            Strategy::FencedBlock => "fenced_block",
            Strategy::BraceScan => "brace_scan",
        }
    }

    fn candidates(self, raw: &str) -> Vec<&str> {
        match self {
            Strategy::Strict => vec![raw.trim()],
            Strategy::FencedBlock => FENCED_BLOCK
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| vec![m.as_str().trim()])
                .unwrap_or_default(),
            Strategy::BraceScan => {
                let mut out = Vec::new();
                for (open, close) in [('{', '}'), ('[', ']')] {
                    if let Some(balanced) = balanced_span(raw, open, close) {
                        out.push(balanced);
                    }
                    if let Some(widest) = widest_span(raw, open, close) {
                        if !out.contains(&widest) {
                            out.push(widest);
                        }
                    }
                }
                out
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("response was empty")]
    Empty,
    #[error("no parseable JSON in response ({reason}); raw: {preview}")]
    Unparseable { reason: String, preview: String },
}

/// A value parsed out of model output, with the strategy that produced it.
#[derive(Debug, Clone)]
pub struct Extracted<T> {
    pub value: T,
    pub strategy: Strategy,
}

/// Parse `raw` into `T`, trying each strategy in order.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, ExtractError> {
    parse_json_with_strategy(raw).map(|e| e.value)
}

pub fn parse_json_with_strategy<T: DeserializeOwned>(
    raw: &str,
) -> Result<Extracted<T>, ExtractError> {
    if raw.trim().is_empty() {
        return Err(ExtractError::Empty);
    }

    let mut last_reason = String::from("no candidate span");
    for strategy in Strategy::ALL {
        for candidate in strategy.candidates(raw) {
            if candidate.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(candidate) {
                Ok(value) => return Ok(Extracted { value, strategy }),
                Err(e) => last_reason = format!("{}: {e}", strategy.as_str()),
            }
        }
    }

    Err(ExtractError::Unparseable {
        reason: last_reason,
        preview: raw.chars().take(200).collect(),
    })
}

/// First `open ... close` span whose delimiters balance, ignoring delimiters
/// inside JSON strings.
fn balanced_span(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let rest = &s[start..];
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in rest.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&rest[..i + close.len_utf8()]);
            }
        }
    }
    None
}

fn widest_span(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let end = s.rfind(close)?;
    (end > start).then(|| &s[start..end + close.len_utf8()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Score {
        quality_score: f64,
    }

    #[test]
    fn strict_json() {
        let got = parse_json_with_strategy::<Score>(r#" {"quality_score": 0.8} "#).unwrap();
        assert_eq!(got.value.quality_score, 0.8);
        assert_eq!(got.strategy, Strategy::Strict);
    }

    #[test]
    fn fenced_block() {
        let raw = "Here you go:\n```json\n{\"quality_score\": 0.65}\n```\nThanks.";
        let got = parse_json_with_strategy::<Score>(raw).unwrap();
        assert_eq!(got.value.quality_score, 0.65);
        assert_eq!(got.strategy, Strategy::FencedBlock);
    }

    #[test]
    fn brace_scan_in_prose() {
        let raw = r#"My verdict is {"quality_score": 0.9} overall."#;
        let got = parse_json_with_strategy::<Score>(raw).unwrap();
        assert_eq!(got.value.quality_score, 0.9);
        assert_eq!(got.strategy, Strategy::BraceScan);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_scan() {
        #[derive(Deserialize)]
        struct T {
            text: String,
        }
        let raw = r#"noise {"text": "a {b} c"} trailing }"#;
        let got: T = parse_json(raw).unwrap();
        assert_eq!(got.text, "a {b} c");
    }

    #[test]
    fn arrays_are_found() {
        let raw = "Sources:\n[{\"title\": \"Inferno\"}]";
        let got: Vec<serde_json::Value> = parse_json(raw).unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn failures_are_typed() {
        assert!(matches!(parse_json::<Score>("   "), Err(ExtractError::Empty)));
        assert!(matches!(
            parse_json::<Score>("no json here"),
            Err(ExtractError::Unparseable { .. })
        ));
    }
}
