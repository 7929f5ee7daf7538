//! Staged recovery of structured payloads from malformed model output.
//!
//! Each stage is a pure text transform. Stages run in order, each one feeding
//! the next, and a JSON parse is attempted after every stage. The pipeline is
//! total: when nothing parses, the original text comes back as plain text.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

pub type Stage = fn(&str) -> String;

/// The ordered stages, named for diagnostics.
pub const STAGES: &[(&str, Stage)] = &[
    ("sanitize", sanitize_characters as Stage),
    ("backtick", unwrap_backticks as Stage),
    ("shape", normalize_shape as Stage),
    ("plain_text", encode_plain_text as Stage),
    ("syntax", repair_syntax as Stage),
];

#[derive(Debug, Clone, PartialEq)]
pub enum Recovered {
    Value(Value),
    Text(String),
}

/// Where the first parse attempt broke, for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub message: String,
    pub offset: usize,
    pub context: String,
}

impl ParseFailure {
    pub fn describe(&self) -> String {
        format!(
            "{} at char {} near {:?}",
            self.message, self.offset, self.context
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub recovered: Recovered,
    /// Stage that produced a parseable payload; `None` when the raw text parsed or nothing did.
    pub stage: Option<&'static str>,
    pub failure: Option<ParseFailure>,
}

impl RecoveryOutcome {
    pub fn value(&self) -> Option<&Value> {
        match &self.recovered {
            Recovered::Value(v) => Some(v),
            Recovered::Text(_) => None,
        }
    }

    /// True when every stage failed and the text was returned untouched.
    pub fn exhausted(&self) -> bool {
        self.stage.is_none() && self.failure.is_some()
    }
}

pub fn recover(raw: &str) -> RecoveryOutcome {
    let first_failure = match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            return RecoveryOutcome {
                recovered: classify(value),
                stage: None,
                failure: None,
            };
        }
        Err(err) => failure_at(raw, &err),
    };

    let mut current = raw.to_string();
    for &(name, stage) in STAGES {
        current = stage(&current);
        if let Ok(value) = serde_json::from_str::<Value>(&current) {
            return RecoveryOutcome {
                recovered: classify(value),
                stage: Some(name),
                failure: Some(first_failure),
            };
        }
    }

    RecoveryOutcome {
        recovered: Recovered::Text(raw.to_string()),
        stage: None,
        failure: Some(first_failure),
    }
}

fn classify(value: Value) -> Recovered {
    match value {
        Value::String(text) => Recovered::Text(text),
        other => Recovered::Value(other),
    }
}

fn failure_at(raw: &str, err: &serde_json::Error) -> ParseFailure {
    let offset = char_offset(raw, err.line(), err.column());
    let chars: Vec<char> = raw.chars().collect();
    let start = offset.saturating_sub(20);
    let end = (offset + 20).min(chars.len());
    ParseFailure {
        message: err.to_string(),
        offset,
        context: chars[start.min(end)..end].iter().collect(),
    }
}

fn char_offset(raw: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (idx, text) in raw.split('\n').enumerate() {
        if idx + 1 == line {
            return offset + column.saturating_sub(1).min(text.chars().count());
        }
        offset += text.chars().count() + 1;
    }
    raw.chars().count()
}

/// Stage 1: drop invisible characters and collapse whitespace.
pub fn sanitize_characters(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\u{200B}'..='\u{200D}' | '\u{FEFF}' => {}
            '\t' | '\n' | '\r' => out.push(' '),
            c if (c as u32) < 0x20 || (0x7F..=0x9F).contains(&(c as u32)) => {}
            '\u{00A0}' | '\u{1680}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}'
            | '\u{3000}' | '\u{2028}' | '\u{2029}' => out.push(' '),
            '\u{FFF0}'..='\u{FFFF}' => {}
            c => out.push(c),
        }
    }
    collapse_whitespace(&out)
}

/// Stage 2: unwrap a payload that is entirely backtick-quoted.
pub fn unwrap_backticks(input: &str) -> String {
    let trimmed = input.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_suffix("```").unwrap_or(rest).trim_start();
        strip_language_tag(rest)
    } else if trimmed.len() >= 2 && trimmed.starts_with('`') && trimmed.ends_with('`') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        return input.to_string();
    };
    let inner = inner.trim();
    if is_structurally_valid(inner) {
        inner.to_string()
    } else {
        quote_literal(inner)
    }
}

fn strip_language_tag(text: &str) -> &str {
    let tag_len = text
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(text.len());
    if tag_len == 0 {
        return text;
    }
    let rest = text[tag_len..].trim_start();
    if rest.starts_with('[') || rest.starts_with('{') || rest.is_empty() {
        rest
    } else {
        text
    }
}

/// Balanced bracket literal spanning the whole text.
fn is_structurally_valid(text: &str) -> bool {
    if !(text.starts_with('[') || text.starts_with('{')) {
        return false;
    }
    matches!(scan_literals(text).as_slice(), [(0, end)] if *end == text.len())
}

/// Stage 3: pull bracket literals out of surrounding prose and merge several into one array.
///
/// Dash-prefixed object lists (`- {..}` per item) always become an array.
pub fn normalize_shape(input: &str) -> String {
    let trimmed = input.trim();
    let literals = scan_literals(trimmed);
    if literals.is_empty() {
        return input.to_string();
    }
    let dash_list = trimmed.starts_with('-')
        && literals
            .iter()
            .all(|(start, _)| trimmed[*start..].starts_with('{'));

    if literals.len() == 1 && !dash_list {
        let (start, end) = literals[0];
        return trimmed[start..end].to_string();
    }

    let mut items = Vec::new();
    for (start, end) in &literals {
        let candidate = strip_trailing_commas(&trimmed[*start..*end]);
        match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Array(values)) if !dash_list => items.extend(values),
            Ok(value) => items.push(value),
            Err(_) => {
                let (start, end) = literals[0];
                return trimmed[start..end].to_string();
            }
        }
    }
    Value::Array(items).to_string()
}

/// Stage 4: anything that still is not bracketed or quoted becomes a string literal.
pub fn encode_plain_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') || trimmed.starts_with('"') {
        return input.to_string();
    }
    quote_literal(trimmed)
}

static TRAILING_COMMA: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r",(\s*[\]}])").ok());
static EMPTY_VALUE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r":\s*,").ok());
static BARE_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_\-]*)\s*:").ok());

/// Stage 5: common hand-written JSON mistakes.
pub fn repair_syntax(input: &str) -> String {
    let mut fixed = collapse_whitespace(input);
    fixed = fixed
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect();
    if !fixed.contains('"') {
        fixed = fixed.replace('\'', "\"");
    }
    fixed = replace_all(&EMPTY_VALUE, &fixed, ": null,");
    fixed = strip_trailing_commas(&fixed);
    replace_all(&BARE_KEY, &fixed, "$1\"$2\":")
}

fn strip_trailing_commas(text: &str) -> String {
    replace_all(&TRAILING_COMMA, text, "$1")
}

fn replace_all(re: &LazyLock<Option<Regex>>, text: &str, replacement: &str) -> String {
    match LazyLock::force(re) {
        Some(re) => re.replace_all(text, replacement).into_owned(),
        None => text.to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn quote_literal(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Byte ranges of top-level `[..]`/`{..}` literals.
///
/// Quotes are only tracked inside a literal, so apostrophes in prose do not
/// confuse the scan. Unterminated literals are dropped.
pub fn scan_literals(text: &str) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if stack.is_empty() {
            match ch {
                '[' => {
                    stack.push(']');
                    start = idx;
                }
                '{' => {
                    stack.push('}');
                    start = idx;
                }
                _ => {}
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                stack.pop();
                if stack.is_empty() {
                    found.push((start, idx + ch.len_utf8()));
                }
            }
            _ => {}
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn yaml_style_list_becomes_array() {
        let out = recover("- {\"path\": \"a.go\"}\n- {\"path\": \"b.go\"}");
        assert_eq!(
            out.value(),
            Some(&json!([{"path": "a.go"}, {"path": "b.go"}]))
        );
        assert_eq!(out.stage, Some("shape"));
    }

    #[test]
    fn single_dash_item_is_still_an_array() {
        let out = recover("- {\"path\": \"a.go\"}");
        assert_eq!(out.value(), Some(&json!([{"path": "a.go"}])));
    }

    #[test]
    fn valid_json_skips_every_stage() {
        let out = recover(r#"[{"type":"FILE_CONTENT","path":"main.go"}]"#);
        assert_eq!(out.stage, None);
        assert!(out.failure.is_none());
        assert!(out.value().is_some());
    }

    #[test]
    fn zero_width_characters_are_removed() {
        let out = recover("\u{FEFF}[\u{200B}\"main.go\"]");
        assert_eq!(out.value(), Some(&json!(["main.go"])));
        assert_eq!(out.stage, Some("sanitize"));
    }

    #[test]
    fn backticked_json_is_unwrapped() {
        assert_eq!(unwrap_backticks("`[\"a.go\"]`"), "[\"a.go\"]");
        assert_eq!(unwrap_backticks("```json [\"a.go\"] ```"), "[\"a.go\"]");
    }

    #[test]
    fn backticked_prose_becomes_string_literal() {
        assert_eq!(unwrap_backticks("`check main.go`"), "\"check main.go\"");
        let out = recover("`check main.go`");
        assert_eq!(out.recovered, Recovered::Text("check main.go".to_string()));
    }

    #[test]
    fn prose_around_array_is_stripped() {
        let out = recover("Here are the files: [\"a.go\", \"b.go\"] thanks!");
        assert_eq!(out.value(), Some(&json!(["a.go", "b.go"])));
    }

    #[test]
    fn prose_separated_arrays_are_merged() {
        let out = recover("[\"a.go\"] and also [\"b.go\", \"c.go\"]");
        assert_eq!(out.value(), Some(&json!(["a.go", "b.go", "c.go"])));
    }

    #[test]
    fn brackets_inside_strings_do_not_end_literal() {
        let text = r#"note [{"path": "weird]name.go"}] end"#;
        assert_eq!(scan_literals(text).len(), 1);
        let out = recover(text);
        assert_eq!(out.value(), Some(&json!([{"path": "weird]name.go"}])));
    }

    #[test]
    fn apostrophes_in_prose_are_ignored_by_scanner() {
        let text = "I don't know, maybe [\"a.go\"]";
        assert_eq!(scan_literals(text), vec![(20, text.len())]);
    }

    #[test]
    fn plain_text_is_returned_as_text() {
        let out = recover("please send me the handler file");
        assert_eq!(
            out.recovered,
            Recovered::Text("please send me the handler file".to_string())
        );
        assert_eq!(out.stage, Some("plain_text"));
    }

    #[test]
    fn trailing_commas_and_bare_keys_are_repaired() {
        let out = recover("[{path: \"a.go\", type: \"FILE_CONTENT\",},]");
        assert_eq!(
            out.value(),
            Some(&json!([{"path": "a.go", "type": "FILE_CONTENT"}]))
        );
    }

    #[test]
    fn smart_quotes_are_normalized() {
        let fixed = repair_syntax("{\u{201C}path\u{201D}: \u{201C}a.go\u{201D}}");
        assert_eq!(fixed, "{\"path\": \"a.go\"}");
    }

    #[test]
    fn unrecoverable_text_returns_original_with_failure_offset() {
        let raw = "{\"path\": [unclosed";
        let out = recover(raw);
        assert_eq!(out.recovered, Recovered::Text(raw.to_string()));
        assert!(out.exhausted());
        let failure = out.failure.expect("failure");
        assert!(failure.offset <= raw.chars().count());
        assert!(!failure.context.is_empty());
    }

    #[test]
    fn every_stage_is_pure_on_empty_input() {
        for (_, stage) in STAGES {
            let _ = stage("");
        }
        let out = recover("");
        assert_eq!(out.recovered, Recovered::Text(String::new()));
    }
}
