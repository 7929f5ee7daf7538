//! Heuristic extraction of file paths from free text.

use regex::Regex;
use repairflow_core::{FileRequest, PlanStep};
use std::sync::LazyLock;

const SOURCE_EXTENSIONS: &str =
    "go|proto|rs|py|js|jsx|ts|tsx|java|kt|c|h|cc|cpp|hpp|rb|php|cs|swift|json|yaml|yml|toml|mod|sum|md|txt|sh|gradle";

static BACKTICK_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"`([^`\s]+)`").ok());
static PATH_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?:^|[\s("'`\[,:])((?:\.{{0,2}}/)?(?:[\w.\-]+/)*[\w.\-]+\.(?:{SOURCE_EXTENSIONS}))\b"#
    ))
    .ok()
});
static JSON_OBJECT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{[^{}]*\}").ok());
static JSON_PATH: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""(?:path|filePath|file_path)"\s*:\s*"([^"]+)""#).ok());
static JSON_TYPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""(?:type|kind)"\s*:\s*"([^"]+)""#).ok());

/// True when `token` ends in an extension we treat as a project file.
pub fn has_source_extension(token: &str) -> bool {
    let Some((_, ext)) = token.rsplit_once('.') else {
        return false;
    };
    SOURCE_EXTENSIONS
        .split('|')
        .any(|candidate| candidate.eq_ignore_ascii_case(ext))
}

/// Backtick-quoted or path-shaped tokens carrying a known extension.
pub fn mine_paths(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let cleaned = candidate
            .trim_matches(|c: char| matches!(c, '"' | '\'' | ',' | ';' | ')' | '('))
            .trim_end_matches('.');
        if has_source_extension(cleaned)
            && !cleaned.contains("://")
            && !out.iter().any(|existing| existing == cleaned)
        {
            out.push(cleaned.to_string());
        }
    };
    if let Some(re) = LazyLock::force(&BACKTICK_TOKEN) {
        for caps in re.captures_iter(text) {
            push(&caps[1]);
        }
    }
    if let Some(re) = LazyLock::force(&PATH_TOKEN) {
        for caps in re.captures_iter(text) {
            push(&caps[1]);
        }
    }
    out
}

/// File requests implied by plan steps and plan prose.
pub fn mine_plan_requests(steps: &[PlanStep], plan_text: &str) -> Vec<FileRequest> {
    let mut out: Vec<FileRequest> = Vec::new();
    for step in steps {
        let Some(target) = step.target.as_deref() else {
            continue;
        };
        let wants_content = step.action.as_deref().is_none_or(|action| {
            let action = action.to_ascii_uppercase();
            ["REVIEW", "REQUEST", "READ", "CHECK", "INSPECT", "ANALY"]
                .iter()
                .any(|verb| action.contains(verb))
        });
        if wants_content && !target.trim().is_empty() {
            let request = if target.ends_with('/') {
                FileRequest::directory(target.trim_end_matches('/'))
            } else {
                FileRequest::file(target.trim())
            };
            if !out.contains(&request) {
                out.push(request);
            }
        }
    }
    for path in mine_paths(plan_text) {
        let request = FileRequest::file(path);
        if !out.contains(&request) {
            out.push(request);
        }
    }
    out
}

/// Last-resort scan of broken JSON for `"path": "..."` pairs inside `{..}` objects.
pub fn path_pairs(text: &str) -> Vec<FileRequest> {
    let (Some(object_re), Some(path_re), Some(type_re)) = (
        LazyLock::force(&JSON_OBJECT),
        LazyLock::force(&JSON_PATH),
        LazyLock::force(&JSON_TYPE),
    ) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for object in object_re.find_iter(text) {
        let body = object.as_str();
        let Some(path) = path_re.captures(body).map(|c| c[1].to_string()) else {
            continue;
        };
        let is_dir = type_re
            .captures(body)
            .is_some_and(|c| c[1].to_ascii_uppercase().contains("DIR"));
        out.push(if is_dir {
            FileRequest::directory(path)
        } else {
            FileRequest::file(path)
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mines_backticked_and_bare_paths() {
        let text = "Open `server/main.go` and then look at proto/service.proto, not http://x.io/a.go";
        let paths = mine_paths(text);
        assert_eq!(paths, vec!["server/main.go", "proto/service.proto"]);
    }

    #[test]
    fn ignores_tokens_without_known_extension() {
        assert!(mine_paths("call `handleRequest` in the `server` package").is_empty());
    }

    #[test]
    fn plan_steps_with_review_actions_become_requests() {
        let steps = vec![
            PlanStep {
                index: 1,
                action: Some("REVIEW_FILE_CONTENT".to_string()),
                target: Some("api/handler.go".to_string()),
                description: "check handler".to_string(),
            },
            PlanStep {
                index: 2,
                action: Some("MODIFY_FILE".to_string()),
                target: Some("api/other.go".to_string()),
                description: "edit".to_string(),
            },
        ];
        let requests = mine_plan_requests(&steps, "");
        assert_eq!(requests, vec![FileRequest::file("api/handler.go")]);
    }

    #[test]
    fn path_pairs_survive_broken_json() {
        let broken = r#"[{"type": "DIRECTORY_LISTING", "path": "pkg"}, {"path": "main.go" oops"#;
        let requests = path_pairs(broken);
        assert_eq!(requests, vec![FileRequest::directory("pkg")]);
    }
}
