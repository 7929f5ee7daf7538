//! Turns raw model text into a [`ParsedResponse`].
//!
//! Responses are organised in sections that start with a `%_Name_%` marker line
//! and run until the next marker. `%%_Fin_%%` ends the response. Parsing never
//! fails: anything that cannot be recovered is reported in `parse_warnings`.

pub mod mining;
pub mod recovery;

use recovery::{Recovered, recover};
use repairflow_core::{COMPLETION_MARKER, FileRequest, ParsedResponse, PlanStep, Priority};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Thought,
    Plan,
    ReplyRequired,
    Modified,
    Comment,
    CorrectionGoals,
    VerificationReport,
}

enum Marker {
    Section(Section),
    ReadyForFinalCheck,
}

#[derive(Default)]
struct Buffers {
    thought: Vec<String>,
    plan: Vec<String>,
    reply_required: Option<Vec<String>>,
    modified: Vec<String>,
    comment: Vec<String>,
    correction_goals: Vec<String>,
    verification_report: Vec<String>,
}

impl Buffers {
    fn push(&mut self, section: Section, line: &str) {
        let target = match section {
            Section::Thought => &mut self.thought,
            Section::Plan => &mut self.plan,
            Section::ReplyRequired => self.reply_required.get_or_insert_with(Vec::new),
            Section::Modified => &mut self.modified,
            Section::Comment => &mut self.comment,
            Section::CorrectionGoals => &mut self.correction_goals,
            Section::VerificationReport => &mut self.verification_report,
        };
        target.push(line.to_string());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseParser;

impl ResponseParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &str) -> ParsedResponse {
        parse_response(raw)
    }
}

pub fn parse_response(raw: &str) -> ParsedResponse {
    let text = raw.replace("\r\n", "\n");
    let mut parsed = ParsedResponse::default();

    if !has_marker_lines(&text) {
        let body = strip_fences(&text);
        if looks_like_bare_requests(&body) {
            parsed.file_requests = requests_from_payload(&body, &mut parsed.parse_warnings);
            return parsed;
        }
    }

    let mut buffers = Buffers::default();
    let mut current: Option<Section> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.contains(COMPLETION_MARKER) {
            parsed.completion_signal = true;
            break;
        }
        if let Some(marker) = marker_of(trimmed) {
            match marker {
                Marker::Section(section) => {
                    if section == Section::ReplyRequired {
                        buffers.reply_required.get_or_insert_with(Vec::new);
                    }
                    current = Some(section);
                }
                Marker::ReadyForFinalCheck => {
                    parsed.ready_for_final_check = true;
                    current = None;
                }
            }
            continue;
        }
        if let Some(section) = current {
            buffers.push(section, line);
        }
    }

    parsed.thought = non_empty(&buffers.thought);
    parsed.correction_goals = non_empty(&buffers.correction_goals);
    parsed.verification_report = non_empty(&buffers.verification_report);
    parsed.comment_text = non_empty(&buffers.comment).unwrap_or_default();
    parsed.modified_diff = non_empty(&buffers.modified)
        .map(|diff| {
            let mut diff = strip_fences(&diff);
            if !diff.is_empty() && !diff.ends_with('\n') {
                diff.push('\n');
            }
            diff
        })
        .unwrap_or_default();

    if let Some(plan_text) = non_empty(&buffers.plan) {
        parsed.plan = parse_plan(&plan_text, &mut parsed.parse_warnings);
    }

    match &buffers.reply_required {
        Some(lines) => {
            parsed.file_requests = requests_from_lines(lines, &mut parsed.parse_warnings);
        }
        None if !parsed.has_diff() && !parsed.completion_signal => {
            let steps = parsed.plan.as_deref().unwrap_or_default();
            let plan_text = non_empty(&buffers.plan).unwrap_or_default();
            parsed.file_requests = mining::mine_plan_requests(steps, &plan_text);
        }
        None => {}
    }
    dedupe_requests(&mut parsed.file_requests);
    parsed
}

fn has_marker_lines(text: &str) -> bool {
    text.lines().any(|line| {
        let trimmed = line.trim();
        trimmed.contains(COMPLETION_MARKER) || marker_name(trimmed).is_some()
    })
}

fn marker_name(line: &str) -> Option<&str> {
    let name = line.strip_prefix("%_")?.strip_suffix("_%")?;
    if name.is_empty() || name.starts_with('%') || name.ends_with('%') {
        return None;
    }
    Some(name)
}

fn marker_of(line: &str) -> Option<Marker> {
    let name = marker_name(line)?
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '-'], "_");
    let marker = match name.as_str() {
        "thought" | "thoughts" => Marker::Section(Section::Thought),
        "plan" => Marker::Section(Section::Plan),
        "modified" | "modified_diff" | "diff" => Marker::Section(Section::Modified),
        "comment" | "comments" => Marker::Section(Section::Comment),
        "correction_goals" | "correction_goal" => Marker::Section(Section::CorrectionGoals),
        "verification_report" | "verification" => Marker::Section(Section::VerificationReport),
        "ready_for_final_check" => Marker::ReadyForFinalCheck,
        _ => Marker::Section(Section::ReplyRequired),
    };
    Some(marker)
}

fn non_empty(lines: &[String]) -> Option<String> {
    let joined = lines.join("\n");
    let trimmed = joined.trim_matches('\n');
    if trimmed.trim().is_empty() {
        None
    } else {
        Some(trimmed.trim_end().to_string())
    }
}

/// Drops a surrounding markdown code fence, if any.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text.trim_matches('\n').to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n")
}

fn looks_like_bare_requests(body: &str) -> bool {
    let trimmed = body.trim();
    (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && (trimmed.contains("\"path\"")
            || trimmed.contains("\"type\"")
            || trimmed.contains("\"filePath\""))
}

fn parse_plan(text: &str, warnings: &mut Vec<String>) -> Option<Vec<PlanStep>> {
    let trimmed = text.trim();
    let structured = trimmed.starts_with('[') || trimmed.starts_with('{') || trimmed.starts_with('`');
    let steps = if structured {
        let outcome = recover(trimmed);
        if outcome.exhausted()
            && let Some(failure) = &outcome.failure
        {
            warnings.push(format!("plan section unparseable: {}", failure.describe()));
        }
        match outcome.recovered {
            Recovered::Value(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| step_from_value(idx + 1, item))
                .collect(),
            Recovered::Value(value) => vec![step_from_value(1, &value)],
            Recovered::Text(text) => steps_from_text(&text),
        }
    } else {
        steps_from_text(trimmed)
    };
    if steps.is_empty() { None } else { Some(steps) }
}

fn step_from_value(position: usize, value: &Value) -> PlanStep {
    match value {
        Value::Object(map) => {
            let field = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
            };
            let index = map
                .get("step")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(position);
            let action = field(&["action", "type"]);
            let target = field(&["filePath", "file_path", "path", "file"]);
            let description = field(&["description", "reason", "details", "task"])
                .or_else(|| action.clone())
                .unwrap_or_else(|| value.to_string());
            PlanStep {
                index,
                action,
                target,
                description,
            }
        }
        Value::String(text) => PlanStep {
            index: position,
            action: None,
            target: None,
            description: text.clone(),
        },
        other => PlanStep {
            index: position,
            action: None,
            target: None,
            description: other.to_string(),
        },
    }
}

fn steps_from_text(text: &str) -> Vec<PlanStep> {
    text.lines()
        .map(strip_list_prefix)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(idx, line)| PlanStep {
            index: idx + 1,
            action: None,
            target: None,
            description: line.to_string(),
        })
        .collect()
}

fn strip_list_prefix(line: &str) -> &str {
    let trimmed = line.trim();
    let without_bullet = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| trimmed.strip_prefix("• "))
        .unwrap_or(trimmed);
    let digits = without_bullet
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits > 0 {
        let rest = &without_bullet[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim();
        }
    }
    without_bullet.trim()
}

fn is_structured_line(line: &str) -> bool {
    line.starts_with('[')
        || line.starts_with('{')
        || line.ends_with(']')
        || line.ends_with('}')
        || line.ends_with("},")
        || line.contains("\"path\"")
        || line.contains("\"type\"")
}

fn requests_from_lines(lines: &[String], warnings: &mut Vec<String>) -> Vec<FileRequest> {
    let mut requests = Vec::new();
    let mut json_buffer: Vec<&str> = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("```") {
            continue;
        }
        if is_structured_line(trimmed) {
            json_buffer.push(trimmed);
            continue;
        }
        requests.extend(requests_from_plain_line(trimmed));
    }
    if !json_buffer.is_empty() {
        requests.extend(requests_from_payload(&json_buffer.join("\n"), warnings));
    }
    requests
}

fn requests_from_plain_line(line: &str) -> Vec<FileRequest> {
    let body = strip_list_prefix(line);
    if let Some(quoted) = first_quoted(body) {
        return vec![request_for_path(quoted)];
    }
    let bare = body.trim_matches('`').trim();
    if bare.is_empty() || matches!(bare.to_ascii_lowercase().as_str(), "none" | "n/a" | "-") {
        return Vec::new();
    }
    if !bare.contains(char::is_whitespace) {
        return vec![request_for_path(bare)];
    }
    mining::mine_paths(body)
        .into_iter()
        .map(FileRequest::file)
        .collect()
}

fn first_quoted(text: &str) -> Option<&str> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    let end = rest.find('"')?;
    let quoted = rest[..end].trim();
    if quoted.is_empty() { None } else { Some(quoted) }
}

fn request_for_path(path: &str) -> FileRequest {
    let path = path.trim();
    if path.len() > 1 && path.ends_with('/') {
        FileRequest::directory(path.trim_end_matches('/'))
    } else {
        FileRequest::file(path)
    }
}

fn requests_from_payload(payload: &str, warnings: &mut Vec<String>) -> Vec<FileRequest> {
    let outcome = recover(payload);
    match &outcome.recovered {
        Recovered::Value(value) => requests_from_value(value),
        Recovered::Text(text) => {
            if outcome.exhausted()
                && let Some(failure) = &outcome.failure
            {
                warnings.push(format!(
                    "reply-required payload unparseable: {}",
                    failure.describe()
                ));
                let pairs = mining::path_pairs(payload);
                if !pairs.is_empty() {
                    return pairs;
                }
            }
            mining::mine_paths(text)
                .into_iter()
                .map(FileRequest::file)
                .collect()
        }
    }
}

fn requests_from_value(value: &Value) -> Vec<FileRequest> {
    match value {
        Value::Array(items) => items.iter().flat_map(requests_from_value).collect(),
        Value::String(path) if !path.trim().is_empty() => vec![request_for_path(path)],
        Value::Object(map) => {
            for nested in ["files", "requests", "required", "reply_required"] {
                if let Some(inner @ Value::Array(_)) = map.get(nested) {
                    return requests_from_value(inner);
                }
            }
            request_from_object(map).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

fn request_from_object(map: &serde_json::Map<String, Value>) -> Option<FileRequest> {
    let (path, dir_key) = ["path", "filePath", "file_path", "file", "directory", "dir"]
        .iter()
        .find_map(|k| {
            map.get(*k)
                .and_then(Value::as_str)
                .map(|p| (p.trim(), matches!(*k, "directory" | "dir")))
        })?;
    if path.is_empty() {
        return None;
    }
    let declared_dir = ["type", "kind"]
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .is_some_and(|t| t.to_ascii_uppercase().contains("DIR"));
    let mut request = if declared_dir || dir_key {
        let trimmed = path.trim_end_matches('/');
        FileRequest::directory(if trimmed.is_empty() { "." } else { trimmed })
    } else {
        request_for_path(path)
    };
    request.priority = map
        .get("priority")
        .and_then(Value::as_str)
        .and_then(Priority::parse);
    Some(request)
}

fn dedupe_requests(requests: &mut Vec<FileRequest>) {
    let mut seen = std::collections::HashSet::new();
    requests.retain(|r| seen.insert((r.kind, r.path.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use repairflow_core::FileRequestKind;

    #[test]
    fn parses_all_sections() {
        let raw = "%_Thought_%\nThe handler ignores the new field.\n%_Plan_%\n1. Read main.go\n2. Patch it\n%_Reply Required_%\n[{\"type\": \"FILE_CONTENT\", \"path\": \"main.go\", \"priority\": \"HIGH\"}]\n%_Comment_%\nnothing else\n";
        let parsed = parse_response(raw);
        assert_eq!(
            parsed.thought.as_deref(),
            Some("The handler ignores the new field.")
        );
        let plan = parsed.plan.expect("plan");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].description, "Read main.go");
        assert_eq!(
            parsed.file_requests,
            vec![FileRequest::file("main.go").with_priority(Priority::High)]
        );
        assert_eq!(parsed.comment_text, "nothing else");
        assert!(!parsed.completion_signal);
    }

    #[test]
    fn completion_marker_stops_scanning() {
        let raw = "%_Thought_%\ndone\n%%_Fin_%%\n%_Modified_%\n--- a/x\n+++ b/x\n";
        let parsed = parse_response(raw);
        assert!(parsed.completion_signal);
        assert!(parsed.modified_diff.is_empty());
    }

    #[test]
    fn completion_marker_alone_is_populated_response() {
        let parsed = parse_response("%%_Fin_%%");
        assert!(parsed.completion_signal);
        assert!(parsed.file_requests.is_empty());
        assert!(parsed.thought.is_none());
    }

    #[test]
    fn modified_section_strips_fences() {
        let raw = "%_Modified_%\n```diff\n--- a/main.go\n+++ b/main.go\n@@ -1 +1 @@\n-a\n+b\n```\n";
        let parsed = parse_response(raw);
        assert_eq!(
            parsed.modified_diff,
            "--- a/main.go\n+++ b/main.go\n@@ -1 +1 @@\n-a\n+b\n"
        );
    }

    #[test]
    fn unknown_tag_is_reply_required() {
        let raw = "%_Need These_%\n\"src/server.go\"\npkg/\n";
        let parsed = parse_response(raw);
        assert_eq!(
            parsed.file_requests,
            vec![
                FileRequest::file("src/server.go"),
                FileRequest::directory("pkg")
            ]
        );
    }

    #[test]
    fn yaml_style_reply_required_is_recovered() {
        let raw = "%_Reply Required_%\n- {\"path\": \"a.go\"}\n- {\"path\": \"b.go\"}\n";
        let parsed = parse_response(raw);
        assert_eq!(
            parsed.file_requests,
            vec![FileRequest::file("a.go"), FileRequest::file("b.go")]
        );
    }

    #[test]
    fn directory_listing_type_is_honoured() {
        let raw = "%_Reply Required_%\n[{\"type\": \"DIRECTORY_LISTING\", \"path\": \"internal/\"}]";
        let parsed = parse_response(raw);
        assert_eq!(parsed.file_requests[0].kind, FileRequestKind::DirectoryListing);
        assert_eq!(parsed.file_requests[0].path, "internal");
    }

    #[test]
    fn bare_json_payload_is_parsed_without_markers() {
        let raw = "```json\n[{\"type\": \"FILE_CONTENT\", \"path\": \"main.go\"}]\n```";
        let parsed = parse_response(raw);
        assert_eq!(parsed.file_requests, vec![FileRequest::file("main.go")]);
    }

    #[test]
    fn plan_paths_are_mined_without_reply_required() {
        let raw = "%_Plan_%\n[{\"step\": 1, \"action\": \"REVIEW_FILE_CONTENT\", \"filePath\": \"server/api.go\", \"reason\": \"entry point\"}]";
        let parsed = parse_response(raw);
        assert_eq!(parsed.file_requests, vec![FileRequest::file("server/api.go")]);
        assert_eq!(parsed.plan.expect("plan")[0].description, "entry point");
    }

    #[test]
    fn plan_paths_are_not_mined_when_a_diff_is_present() {
        let raw = "%_Plan_%\n1. Fix `main.go`\n%_Modified_%\n--- a/main.go\n+++ b/main.go\n";
        let parsed = parse_response(raw);
        assert!(parsed.file_requests.is_empty());
        assert!(parsed.has_diff());
    }

    #[test]
    fn ready_flag_and_correction_goals_are_read() {
        let raw = "%_Correction Goals_%\nKeep the API stable.\n%_Ready_For_Final_Check_%\n";
        let parsed = parse_response(raw);
        assert!(parsed.ready_for_final_check);
        assert_eq!(parsed.correction_goals.as_deref(), Some("Keep the API stable."));
    }

    #[test]
    fn broken_reply_required_json_falls_back_to_path_pairs() {
        let raw = "%_Reply Required_%\n[{\"type\": \"FILE_CONTENT\", \"path\": \"a.go\"}, {\"path\": \"b.go\" ]]]";
        let parsed = parse_response(raw);
        assert!(parsed
            .file_requests
            .iter()
            .any(|r| r.path == "a.go"));
    }

    #[test]
    fn duplicate_requests_are_collapsed() {
        let raw = "%_Reply Required_%\nmain.go\n\"main.go\"\n";
        let parsed = parse_response(raw);
        assert_eq!(parsed.file_requests.len(), 1);
    }

    #[test]
    fn prose_reply_lines_only_yield_paths() {
        let raw = "%_Reply Required_%\nPlease provide the following files:\n- `cmd/main.go`\n";
        let parsed = parse_response(raw);
        assert_eq!(parsed.file_requests, vec![FileRequest::file("cmd/main.go")]);
    }

    proptest! {
        #[test]
        fn parser_is_total_for_arbitrary_text(raw in ".{0,400}") {
            let parsed = parse_response(&raw);
            for request in &parsed.file_requests {
                prop_assert!(!request.path.is_empty());
            }
        }

        #[test]
        fn parser_is_total_for_marker_soup(
            parts in prop::collection::vec(
                prop_oneof![
                    Just("%_Thought_%".to_string()),
                    Just("%_Plan_%".to_string()),
                    Just("%_Reply Required_%".to_string()),
                    Just("%_Modified_%".to_string()),
                    Just("%%_Fin_%%".to_string()),
                    Just("[{\"path\": ".to_string()),
                    Just("- {\"path\": \"x.go\"}".to_string()),
                    Just("`".to_string()),
                    "[a-z{}\\[\\]\",:/. ]{0,30}",
                ],
                0..20,
            )
        ) {
            let raw = parts.join("\n");
            let parsed = parse_response(&raw);
            prop_assert!(parsed.modified_diff.is_empty() || parsed.modified_diff.ends_with('\n'));
        }
    }
}
